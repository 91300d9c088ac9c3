//! Servant dispatch interfaces.

use crate::info::ConnectionInfo;
use async_trait::async_trait;
use rpcwire_protocol::{
    Context, Encapsulation, EncodingVersion, Identity, OperationMode, ReplyBody, Request,
    RequestFailedInfo,
};
use std::sync::Arc;
use thiserror::Error;

/// Everything a servant knows about the request being dispatched.
#[derive(Debug, Clone)]
pub struct Current {
    pub connection: Arc<ConnectionInfo>,
    /// 0 for oneway and batched requests.
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub encoding: EncodingVersion,
}

impl Current {
    pub fn new(connection: Arc<ConnectionInfo>, request_id: i32, request: &Request) -> Self {
        Self {
            connection,
            request_id,
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            mode: request.mode,
            context: request.context.clone(),
            encoding: request.params.encoding,
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    pub fn failed_info(&self) -> RequestFailedInfo {
        RequestFailedInfo {
            identity: self.identity.clone(),
            facet: self.facet.clone(),
            operation: self.operation.clone(),
        }
    }
}

/// Ways a dispatch can fail. Each maps to one reply status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("object does not exist")]
    ObjectNotExist,

    #[error("facet does not exist")]
    FacetNotExist,

    #[error("operation does not exist")]
    OperationNotExist,

    /// A declared exception, marshaled by the servant.
    #[error("user exception")]
    UserException(Encapsulation),

    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    #[error("unknown exception: {0}")]
    Unknown(String),
}

pub type DispatchResult = Result<Encapsulation, DispatchError>;

/// Builds the reply body for a finished dispatch.
pub fn reply_body(current: &Current, result: DispatchResult) -> ReplyBody {
    match result {
        Ok(params) => ReplyBody::Ok(params),
        Err(DispatchError::UserException(params)) => ReplyBody::UserException(params),
        Err(DispatchError::ObjectNotExist) => ReplyBody::ObjectNotExist(current.failed_info()),
        Err(DispatchError::FacetNotExist) => ReplyBody::FacetNotExist(current.failed_info()),
        Err(DispatchError::OperationNotExist) => {
            ReplyBody::OperationNotExist(current.failed_info())
        }
        Err(DispatchError::UnknownLocal(s)) => ReplyBody::UnknownLocalException(s),
        Err(DispatchError::UnknownUser(s)) => ReplyBody::UnknownUserException(s),
        Err(DispatchError::Unknown(s)) => ReplyBody::UnknownException(s),
    }
}

/// A servant: handles every operation for one identity/facet.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, current: &Current, params: Encapsulation) -> DispatchResult;
}

/// Finds the servant for an incoming request.
pub trait ServantLocator: Send + Sync {
    /// Returns [`DispatchError::ObjectNotExist`] or
    /// [`DispatchError::FacetNotExist`] when nothing matches.
    fn locate(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Dispatcher>, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportInfo;
    use rpcwire_protocol::ENCODING_1_1;

    fn current(request_id: i32) -> Current {
        let request = Request::new(Identity::new("obj"), "op").with_facet("f");
        Current::new(
            Arc::new(ConnectionInfo::new(true, TransportInfo::new("duplex"))),
            request_id,
            &request,
        )
    }

    #[test]
    fn test_reply_body_mapping() {
        let c = current(5);
        assert!(!c.is_oneway());
        let payload = Encapsulation::new(ENCODING_1_1, &b"\x01"[..]);
        assert_eq!(
            reply_body(&c, Ok(payload.clone())),
            ReplyBody::Ok(payload.clone())
        );
        assert_eq!(
            reply_body(&c, Err(DispatchError::UserException(payload.clone()))),
            ReplyBody::UserException(payload)
        );
        match reply_body(&c, Err(DispatchError::FacetNotExist)) {
            ReplyBody::FacetNotExist(info) => {
                assert_eq!(info.facet, "f");
                assert_eq!(info.operation, "op");
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(
            reply_body(&c, Err(DispatchError::Unknown("boom".into()))).status(),
            rpcwire_protocol::ReplyStatus::UnknownException
        );
    }

    #[test]
    fn test_oneway_current() {
        assert!(current(0).is_oneway());
    }
}
