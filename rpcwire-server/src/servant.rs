//! Servant registry and dispatcher variants.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rpcwire_core::{Current, DispatchError, DispatchResult, Dispatcher, ServantLocator};
use rpcwire_protocol::{Encapsulation, Identity};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type id every servant implements.
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// Servants keyed by identity, then facet. The empty facet is the
/// default facet.
#[derive(Default)]
pub struct ServantMap {
    servants: DashMap<Identity, HashMap<String, Arc<dyn Dispatcher>>>,
    /// Fallback servants by identity category ("" matches every category).
    defaults: RwLock<HashMap<String, Arc<dyn Dispatcher>>>,
}

impl std::fmt::Debug for ServantMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServantMap")
            .field("servants", &self.servants.len())
            .field("defaults", &self.defaults.read().len())
            .finish()
    }
}

impl ServantMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `servant` as the default facet of `identity`.
    pub fn add(&self, identity: Identity, servant: Arc<dyn Dispatcher>) {
        self.add_facet(identity, "", servant);
    }

    /// Registers `servant` under `identity` and `facet`, replacing any
    /// previous one.
    pub fn add_facet(&self, identity: Identity, facet: &str, servant: Arc<dyn Dispatcher>) {
        tracing::debug!("Adding servant '{}' facet '{}'", identity, facet);
        self.servants
            .entry(identity)
            .or_default()
            .insert(facet.to_string(), servant);
    }

    pub fn remove(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Dispatcher>> {
        let removed = self
            .servants
            .get_mut(identity)
            .and_then(|mut facets| facets.remove(facet));
        self.servants.remove_if(identity, |_, facets| facets.is_empty());
        removed
    }

    /// Registers a servant for every identity in `category` that has no
    /// servant of its own.
    pub fn add_default_servant(&self, category: &str, servant: Arc<dyn Dispatcher>) {
        self.defaults.write().insert(category.to_string(), servant);
    }

    /// Number of identities with at least one facet.
    pub fn len(&self) -> usize {
        self.servants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servants.is_empty()
    }
}

impl ServantLocator for ServantMap {
    fn locate(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        if let Some(facets) = self.servants.get(identity) {
            return facets
                .get(facet)
                .cloned()
                .ok_or(DispatchError::FacetNotExist);
        }
        let defaults = self.defaults.read();
        defaults
            .get(&identity.category)
            .or_else(|| defaults.get(""))
            .cloned()
            .ok_or(DispatchError::ObjectNotExist)
    }
}

type Handler = Arc<
    dyn Fn(Current, Encapsulation) -> Pin<Box<dyn Future<Output = DispatchResult> + Send>>
        + Send
        + Sync,
>;

/// Servant built from per-operation handlers. Also answers the built-in
/// `ice_ping`, `ice_id`, `ice_ids` and `ice_isA` operations.
pub struct OperationTable {
    type_id: String,
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<_> = self.handlers.keys().collect();
        operations.sort();
        f.debug_struct("OperationTable")
            .field("type_id", &self.type_id)
            .field("operations", &operations)
            .finish()
    }
}

impl OperationTable {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_operation<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Current, Encapsulation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |current, params| Box::pin(handler(current, params))));
        self
    }

    fn type_ids(&self) -> Vec<String> {
        let mut ids = vec![OBJECT_TYPE_ID.to_string(), self.type_id.clone()];
        ids.sort();
        ids.dedup();
        ids
    }

    fn builtin(&self, current: &Current, params: Encapsulation) -> DispatchResult {
        let encoding = params.encoding;
        match current.operation.as_str() {
            "ice_ping" => Ok(Encapsulation::empty(encoding)),
            "ice_id" => Ok(Encapsulation::build(encoding, |os| {
                os.write_string(&self.type_id)
            })),
            "ice_ids" => {
                let ids = self.type_ids();
                Ok(Encapsulation::build(encoding, |os| os.write_string_seq(&ids)))
            }
            "ice_isA" => {
                let mut is = params
                    .reader()
                    .map_err(|e| DispatchError::UnknownLocal(e.to_string()))?;
                let id = is
                    .read_string()
                    .map_err(|e| DispatchError::UnknownLocal(e.to_string()))?;
                let matches = self.type_ids().contains(&id);
                Ok(Encapsulation::build(encoding, |os| os.write_bool(matches)))
            }
            _ => Err(DispatchError::OperationNotExist),
        }
    }
}

#[async_trait]
impl Dispatcher for OperationTable {
    async fn dispatch(&self, current: &Current, params: Encapsulation) -> DispatchResult {
        match self.handlers.get(&current.operation) {
            Some(handler) => handler(current.clone(), params).await,
            None => self.builtin(current, params),
        }
    }
}

type Hook = Box<dyn Fn(&Current) -> Result<(), DispatchError> + Send + Sync>;

/// Runs a check before handing the request to the wrapped servant.
pub struct Interceptor {
    target: Arc<dyn Dispatcher>,
    before: Hook,
}

impl Interceptor {
    pub fn new<F>(target: Arc<dyn Dispatcher>, before: F) -> Self
    where
        F: Fn(&Current) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        Self {
            target,
            before: Box::new(before),
        }
    }
}

#[async_trait]
impl Dispatcher for Interceptor {
    async fn dispatch(&self, current: &Current, params: Encapsulation) -> DispatchResult {
        if let Err(e) = (self.before)(current) {
            tracing::debug!(
                "[{}] Intercepted '{}' on '{}': {}",
                current.connection,
                current.operation,
                current.identity,
                e
            );
            return Err(e);
        }
        self.target.dispatch(current, params).await
    }
}

/// Returns its parameters unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl Dispatcher for Echo {
    async fn dispatch(&self, _current: &Current, params: Encapsulation) -> DispatchResult {
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_core::{ConnectionInfo, TransportInfo};
    use rpcwire_protocol::{Request, ENCODING_1_1};

    fn current(identity: Identity, operation: &str) -> Current {
        let request = Request::new(identity, operation);
        Current::new(
            Arc::new(ConnectionInfo::new(true, TransportInfo::new("test"))),
            1,
            &request,
        )
    }

    fn locate_err(map: &ServantMap, identity: &Identity, facet: &str) -> DispatchError {
        match map.locate(identity, facet) {
            Ok(_) => panic!("expected locate to fail"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_servant_map_lookup() {
        let map = ServantMap::new();
        let hello = Identity::new("hello");
        map.add(hello.clone(), Arc::new(Echo));
        map.add_facet(hello.clone(), "admin", Arc::new(Echo));
        assert_eq!(map.len(), 1);

        assert!(map.locate(&hello, "").is_ok());
        assert!(map.locate(&hello, "admin").is_ok());
        assert_eq!(locate_err(&map, &hello, "other"), DispatchError::FacetNotExist);
        assert_eq!(
            locate_err(&map, &Identity::new("nobody"), ""),
            DispatchError::ObjectNotExist
        );

        assert!(map.remove(&hello, "").is_some());
        assert!(map.remove(&hello, "admin").is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn test_default_servant_by_category() {
        let map = ServantMap::new();
        map.add_default_servant("files", Arc::new(Echo));

        let file = Identity::new("readme").with_category("files");
        assert!(map.locate(&file, "").is_ok());
        assert_eq!(
            locate_err(&map, &Identity::new("readme"), ""),
            DispatchError::ObjectNotExist
        );

        map.add_default_servant("", Arc::new(Echo));
        assert!(map.locate(&Identity::new("anything"), "").is_ok());
    }

    #[test]
    fn test_operation_table_dispatch() {
        let table = OperationTable::new("::Demo::Counter").with_operation(
            "double",
            |_current, params: Encapsulation| async move {
                let n = match params.reader().and_then(|mut is| is.read_i32()) {
                    Ok(n) => n,
                    Err(e) => return Err(DispatchError::UnknownLocal(e.to_string())),
                };
                Ok::<_, DispatchError>(Encapsulation::build(ENCODING_1_1, |os| os.write_i32(n * 2)))
            },
        );
        let id = Identity::new("counter");

        let params = Encapsulation::build(ENCODING_1_1, |os| os.write_i32(21));
        let result =
            tokio_test::block_on(table.dispatch(&current(id.clone(), "double"), params)).unwrap();
        assert_eq!(result.reader().unwrap().read_i32().unwrap(), 42);

        let missing = tokio_test::block_on(
            table.dispatch(&current(id.clone(), "triple"), Encapsulation::default()),
        );
        assert_eq!(missing, Err(DispatchError::OperationNotExist));
    }

    #[test]
    fn test_builtin_operations() {
        let table = OperationTable::new("::Demo::Counter");
        let id = Identity::new("counter");

        let ping = tokio_test::block_on(
            table.dispatch(&current(id.clone(), "ice_ping"), Encapsulation::default()),
        );
        assert!(ping.unwrap().payload.is_empty());

        let type_id = tokio_test::block_on(
            table.dispatch(&current(id.clone(), "ice_id"), Encapsulation::default()),
        )
        .unwrap();
        assert_eq!(type_id.reader().unwrap().read_string().unwrap(), "::Demo::Counter");

        let query = Encapsulation::build(ENCODING_1_1, |os| os.write_string(OBJECT_TYPE_ID));
        let is_a =
            tokio_test::block_on(table.dispatch(&current(id.clone(), "ice_isA"), query)).unwrap();
        assert!(is_a.reader().unwrap().read_bool().unwrap());

        let ids = tokio_test::block_on(
            table.dispatch(&current(id, "ice_ids"), Encapsulation::default()),
        )
        .unwrap();
        assert_eq!(
            ids.reader().unwrap().read_string_seq().unwrap(),
            vec!["::Demo::Counter", "::Ice::Object"]
        );
    }

    #[test]
    fn test_interceptor_blocks_request() {
        let guarded = Interceptor::new(Arc::new(Echo), |current| {
            if current.context.contains_key("token") {
                Ok(())
            } else {
                Err(DispatchError::UnknownLocal("missing token".to_string()))
            }
        });

        let blocked = tokio_test::block_on(
            guarded.dispatch(&current(Identity::new("x"), "op"), Encapsulation::default()),
        );
        assert!(matches!(blocked, Err(DispatchError::UnknownLocal(_))));

        let mut allowed = current(Identity::new("x"), "op");
        allowed.context.insert("token".to_string(), "t".to_string());
        let params = Encapsulation::build(ENCODING_1_1, |os| os.write_i32(7));
        assert_eq!(
            tokio_test::block_on(guarded.dispatch(&allowed, params.clone())),
            Ok(params)
        );
    }
}
