//! FHIR transaction bundle utilities.
//!
//! A FHIR store processes transaction bundle entries strictly in order, and a
//! create cannot forward-reference a resource that does not exist yet. This
//! crate reorders entries so that every internal `urn:uuid:` reference
//! resolves to an entry appearing earlier in the list, duplicating the
//! members of reference cycles as trailing `PUT` updates.
//!
//! Resources are handled as untyped [`serde_json::Value`] trees: the
//! reference scan only cares about the generic JSON shape, not the FHIR type
//! hierarchy.

pub mod convert;
pub mod reorder;

pub use convert::{convert_contained_resources_to_bundle, convert_to_transaction_bundle};
pub use reorder::reorder_bundle;
