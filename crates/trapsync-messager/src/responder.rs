//! Inbound request dispatch.
//!
//! A [`Responders`] table maps each operation code to the handler that
//! answers it. Frames that are not replies to one of our own requests are
//! looked up here.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use trapsync_protocol::{Code, MessageId, Payload};
use trapsync_transport::Connection;

use crate::{Messager, MessagerError};

/// An inbound message that is not a reply to one of our requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Id to answer with.
    pub id: MessageId,
    pub code: Code,
    pub fields: Vec<Vec<u8>>,
}

impl Request {
    /// Decodes the fields as payload `P`.
    pub fn parse<P: Payload>(&self) -> Result<P, MessagerError> {
        Ok(P::parse(&self.fields)?)
    }
}

/// Answers one operation code.
///
/// Handlers run on the messager's read task, one at a time and in arrival
/// order. They must not wait on a `query` of the same messager, since its
/// reply could only be read once the handler returns. Returning an error
/// ends the read loop and closes the connection.
pub trait Handler<C: Connection>: Send + Sync + 'static {
    fn handle(
        &self,
        messager: Arc<Messager<C>>,
        request: Request,
    ) -> BoxFuture<'static, Result<(), MessagerError>>;
}

impl<C, F, Fut> Handler<C> for F
where
    C: Connection,
    F: Fn(Arc<Messager<C>>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagerError>> + Send + 'static,
{
    fn handle(
        &self,
        messager: Arc<Messager<C>>,
        request: Request,
    ) -> BoxFuture<'static, Result<(), MessagerError>> {
        Box::pin(self(messager, request))
    }
}

/// Handler table indexed by code byte.
pub struct Responders<C: Connection> {
    table: [Option<Arc<dyn Handler<C>>>; 256],
}

impl<C: Connection> Responders<C> {
    pub fn new() -> Self {
        Self {
            table: std::array::from_fn(|_| None),
        }
    }

    /// Installs `handler` for `code`, replacing any previous one.
    pub fn register(&mut self, code: Code, handler: impl Handler<C>) -> &mut Self {
        self.table[code.as_u8() as usize] = Some(Arc::new(handler));
        self
    }

    /// Installs a closure handler for `code`.
    pub fn on<F, Fut>(&mut self, code: Code, handler: F) -> &mut Self
    where
        F: Fn(Arc<Messager<C>>, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagerError>> + Send + 'static,
    {
        self.register(code, handler)
    }

    pub fn get(&self, code: Code) -> Option<Arc<dyn Handler<C>>> {
        self.table[code.as_u8() as usize].clone()
    }

    pub fn contains(&self, code: Code) -> bool {
        self.table[code.as_u8() as usize].is_some()
    }
}

impl<C: Connection> Default for Responders<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trapsync_transport::MemoryConnection;

    #[test]
    fn test_register_and_get_by_code() {
        let mut responders: Responders<MemoryConnection> = Responders::new();
        responders.on(Code::Heartbeat, |_m, _r| async { Ok(()) });

        assert!(responders.contains(Code::Heartbeat));
        assert!(responders.get(Code::Heartbeat).is_some());
        assert!(responders.get(Code::Hello).is_none());
    }

    #[test]
    fn test_request_parse_reports_missing_fields() {
        let request = Request {
            id: MessageId(1),
            code: Code::Hello,
            fields: vec![],
        };

        let err = request.parse::<trapsync_protocol::Hello>().unwrap_err();

        assert!(matches!(err, MessagerError::Protocol(_)));
    }
}
