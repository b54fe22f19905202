//! Procedure catalog seam.
//!
//! The preprocessor and handler resolve helper functions and procedure
//! sources through this trait so they can be exercised without a live host
//! catalog; `MemCatalog` is the in-memory implementation used by embedders
//! and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::types::{HostType, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcId(pub u32);

/// Owner identity of a catalog object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u32);

#[derive(Clone, Debug)]
pub struct ProcRecord {
    pub id: ProcId,
    pub name: String,
    pub namespace: String,
    pub owner: OwnerId,
    pub arg_types: Vec<HostType>,
    pub ret_type: HostType,
    /// Set-returning procedure: the child writes an array carrier that the
    /// materializer unrolls into rows.
    pub ret_set: bool,
    pub source: String,
}

pub trait ProcCatalog: Send + Sync {
    /// Fetch a procedure by id.
    fn get(&self, id: ProcId) -> Option<ProcRecord>;

    /// Resolve `path` (either `[name]` or `[schema, name]`) against the
    /// exact argument-type vector.
    fn lookup(&self, path: &[String], arg_types: &[HostType]) -> Option<ProcRecord>;

    /// Whether `owner` may use the function as a helper.
    fn owner_check(&self, id: ProcId, owner: OwnerId) -> bool;

    /// Invoke a text-returning helper with the caller's arguments.
    /// `Ok(None)` means the helper returned NULL.
    fn invoke_text(&self, id: ProcId, args: &[Value]) -> Result<Option<String>, CoreError>;
}

type HelperBody = Arc<dyn Fn(&[Value]) -> Option<String> + Send + Sync>;

/// In-memory catalog.
#[derive(Default)]
pub struct MemCatalog {
    procs: Mutex<HashMap<ProcId, ProcRecord>>,
    bodies: Mutex<HashMap<ProcId, HelperBody>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ProcRecord) {
        self.procs.lock().insert(record.id, record);
    }

    /// Register a callable body for a text-returning helper.
    pub fn insert_helper(
        &self,
        record: ProcRecord,
        body: impl Fn(&[Value]) -> Option<String> + Send + Sync + 'static,
    ) {
        self.bodies.lock().insert(record.id, Arc::new(body));
        self.insert(record);
    }
}

impl ProcCatalog for MemCatalog {
    fn get(&self, id: ProcId) -> Option<ProcRecord> {
        self.procs.lock().get(&id).cloned()
    }

    fn lookup(&self, path: &[String], arg_types: &[HostType]) -> Option<ProcRecord> {
        let (namespace, name) = match path {
            [name] => (None, name.as_str()),
            [namespace, name] => (Some(namespace.as_str()), name.as_str()),
            _ => return None,
        };
        self.procs
            .lock()
            .values()
            .find(|p| {
                p.name == name
                    && namespace.map_or(true, |ns| p.namespace == ns)
                    && p.arg_types == arg_types
            })
            .cloned()
    }

    fn owner_check(&self, id: ProcId, owner: OwnerId) -> bool {
        self.procs
            .lock()
            .get(&id)
            .map(|p| p.owner == owner)
            .unwrap_or(false)
    }

    fn invoke_text(&self, id: ProcId, args: &[Value]) -> Result<Option<String>, CoreError> {
        let body = self
            .bodies
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::Catalog(format!("function {} has no body", id.0)))?;
        Ok(body(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper(id: u32, name: &str, args: Vec<HostType>) -> ProcRecord {
        ProcRecord {
            id: ProcId(id),
            name: name.to_string(),
            namespace: "public".to_string(),
            owner: OwnerId(10),
            arg_types: args,
            ret_type: HostType::Text,
            ret_set: false,
            source: String::new(),
        }
    }

    #[test]
    fn lookup_matches_signature() {
        let catalog = MemCatalog::new();
        catalog.insert(helper(1, "f", vec![HostType::Int4]));
        catalog.insert(helper(2, "f", vec![HostType::Int8]));

        let found = catalog
            .lookup(&["f".to_string()], &[HostType::Int8])
            .expect("found");
        assert_eq!(found.id, ProcId(2));

        assert!(catalog
            .lookup(&["f".to_string()], &[HostType::Text])
            .is_none());
        assert!(catalog
            .lookup(
                &["other".to_string(), "f".to_string()],
                &[HostType::Int4]
            )
            .is_none());
    }

    #[test]
    fn helper_invocation() {
        let catalog = MemCatalog::new();
        catalog.insert_helper(helper(3, "snippet", vec![]), |_| {
            Some("return 42;".to_string())
        });
        let text = catalog.invoke_text(ProcId(3), &[]).expect("invoke");
        assert_eq!(text.as_deref(), Some("return 42;"));
    }
}
