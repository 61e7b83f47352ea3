//! Inbound request handling for each end of a session.
//!
//! [`acceptor`] and [`dialer`] build the [`Responders`] table a session is
//! served with. Every refusal follows the same shape: answer with the
//! matching `_DENIED` code, then close the connection. The handler itself
//! still returns `Ok(())`; the read loop ends on the close.

use std::sync::Arc;

use tracing::{debug, info, warn};

use trapsync_messager::{MessagerError, Request, Responders};
use trapsync_protocol::{
    ClientMark, ClientUnmark, Code, Empty, Hello, HelloAccept, HelloConflict, PartnerChange,
};
use trapsync_transport::Connection;

use crate::{AcceptorHooks, DialerHooks, Propagation, Session};

type HandlerResult = Result<(), MessagerError>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Responders for a session we accepted: `HELLO`, `HEARTBEAT`,
/// `CLIENT_MARK`, `CLIENT_UNMARK` and `BYE`.
pub fn acceptor<C, H>(session: &Arc<Session<C>>, hooks: Arc<H>) -> Responders<C>
where
    C: Connection,
    H: AcceptorHooks,
{
    let mut responders = Responders::new();

    let (s, h) = (Arc::clone(session), Arc::clone(&hooks));
    responders.on(Code::Hello, move |_, request| {
        hello(Arc::clone(&s), Arc::clone(&h), request)
    });

    let s = Arc::clone(session);
    responders.on(Code::Heartbeat, move |_, request| {
        heartbeat(Arc::clone(&s), request)
    });

    register_common(&mut responders, session, hooks);
    responders
}

/// Responders for a session we dialed: `PARTNER_ADD`, `PARTNER_REMOVE`,
/// `CLIENT_MARK`, `CLIENT_UNMARK` and `BYE`.
pub fn dialer<C, H>(session: &Arc<Session<C>>, hooks: Arc<H>) -> Responders<C>
where
    C: Connection,
    H: DialerHooks,
{
    let mut responders = Responders::new();

    let (s, h) = (Arc::clone(session), Arc::clone(&hooks));
    responders.on(Code::PartnerAdd, move |_, request| {
        partner_add(Arc::clone(&s), Arc::clone(&h), request)
    });

    let (s, h) = (Arc::clone(session), Arc::clone(&hooks));
    responders.on(Code::PartnerRemove, move |_, request| {
        partner_remove(Arc::clone(&s), Arc::clone(&h), request)
    });

    register_common(&mut responders, session, hooks);
    responders
}

fn register_common<C, H>(responders: &mut Responders<C>, session: &Arc<Session<C>>, hooks: Arc<H>)
where
    C: Connection,
    H: Propagation,
{
    let (s, h) = (Arc::clone(session), Arc::clone(&hooks));
    responders.on(Code::ClientMark, move |_, request| {
        client_mark(Arc::clone(&s), Arc::clone(&h), request)
    });

    let (s, h) = (Arc::clone(session), hooks);
    responders.on(Code::ClientUnmark, move |_, request| {
        client_unmark(Arc::clone(&s), Arc::clone(&h), request)
    });

    let s = Arc::clone(session);
    responders.on(Code::Bye, move |_, _| {
        let s = Arc::clone(&s);
        async move {
            debug!(conn = %s.id(), peer = %s.peer_addr(), "peer said bye");
            s.close().await;
            Ok(())
        }
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether requests from the peer are allowed: only over an
/// authenticated session, whichever end we are.
///
/// A dialer is authenticated from the moment its read loop routes
/// `HELLO_ACCEPT`, so requests the acceptor sends right after it pass.
fn trusted<C: Connection>(session: &Session<C>) -> bool {
    session.is_authed()
}

async fn deny<C: Connection>(session: &Session<C>, request: &Request, code: Code) -> HandlerResult {
    if let Err(e) = session.messager().reply(request.id, code, &Empty).await {
        debug!(conn = %session.id(), %code, error = %e, "failed to send denial");
    }
    session.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

async fn hello<C, H>(session: Arc<Session<C>>, hooks: Arc<H>, request: Request) -> HandlerResult
where
    C: Connection,
    H: AcceptorHooks,
{
    let peer = session.peer_addr();
    if session.is_authed() {
        warn!(conn = %session.id(), %peer, "repeated HELLO");
        return deny(&session, &request, Code::HelloDenied).await;
    }

    let hello: Hello = match request.parse() {
        Ok(hello) => hello,
        Err(e) => {
            warn!(conn = %session.id(), %peer, error = %e, "malformed HELLO");
            return deny(&session, &request, Code::HelloDenied).await;
        }
    };

    if hello.passphrase != hooks.passphrase() {
        warn!(conn = %session.id(), %peer, "wrong passphrase");
        hooks.on_auth_failed(peer);
        return deny(&session, &request, Code::HelloDenied).await;
    }

    let ours = hooks.partners();
    let conflicts = ours.intersection(&hello.partners);
    if !conflicts.is_empty() {
        info!(
            conn = %session.id(),
            %peer,
            conflicts = conflicts.len(),
            "peer already reachable through existing partners"
        );
        hooks.on_auth_failed(peer);
        let conflict = HelloConflict {
            partners: conflicts,
        };
        if let Err(e) = session
            .messager()
            .reply(request.id, Code::HelloConflict, &conflict)
            .await
        {
            debug!(conn = %session.id(), error = %e, "failed to send HELLO_CONFLICT");
        }
        session.close().await;
        return Ok(());
    }

    let loose = hooks.loose_timeout();
    session.connection().set_timeout(loose);
    session
        .messager()
        .set_max_send_length(usize::from(hello.max_length));

    let accept = HelloAccept {
        max_length: session.advertised_length(),
        heartbeat_period: loose / 2,
        timeout: loose,
        partners: ours,
    };
    session
        .messager()
        .reply(request.id, Code::HelloAccept, &accept)
        .await?;

    session.set_authed();
    info!(conn = %session.id(), %peer, "peer authenticated");
    hooks.on_authed(session.id(), peer);
    Ok(())
}

async fn heartbeat<C: Connection>(session: Arc<Session<C>>, request: Request) -> HandlerResult {
    if !session.is_authed() {
        warn!(conn = %session.id(), peer = %session.peer_addr(), "heartbeat before HELLO");
        return deny(&session, &request, Code::HeartbeatDenied).await;
    }
    session
        .messager()
        .reply(request.id, Code::Heartbeat, &Empty)
        .await
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

async fn partner_add<C, H>(session: Arc<Session<C>>, hooks: Arc<H>, request: Request) -> HandlerResult
where
    C: Connection,
    H: DialerHooks,
{
    if !trusted(&session) {
        return deny(&session, &request, Code::PartnerAddDenied).await;
    }
    let change: PartnerChange = match request.parse() {
        Ok(change) => change,
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "malformed PARTNER_ADD");
            return deny(&session, &request, Code::PartnerAddDenied).await;
        }
    };

    let conflicts = hooks.partners().intersection(&change.added);
    if !conflicts.is_empty() {
        info!(
            conn = %session.id(),
            peer = %session.peer_addr(),
            conflicts = conflicts.len(),
            "announced partners are already reachable, dropping edge"
        );
        deny(&session, &request, Code::PartnerAddDenied).await?;
        hooks.partners_conflicted(session.id(), conflicts);
        return Ok(());
    }

    if let Err(e) = hooks.partners_added(session.id(), change.added) {
        debug!(conn = %session.id(), error = %e, "partner add rejected");
        return deny(&session, &request, Code::PartnerAddDenied).await;
    }
    session
        .messager()
        .reply(request.id, Code::PartnerAddAccept, &Empty)
        .await
}

async fn partner_remove<C, H>(
    session: Arc<Session<C>>,
    hooks: Arc<H>,
    request: Request,
) -> HandlerResult
where
    C: Connection,
    H: DialerHooks,
{
    if !trusted(&session) {
        return deny(&session, &request, Code::PartnerRemoveDenied).await;
    }
    let change: PartnerChange = match request.parse() {
        Ok(change) => change,
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "malformed PARTNER_REMOVE");
            return deny(&session, &request, Code::PartnerRemoveDenied).await;
        }
    };

    if let Err(e) = hooks.partners_removed(session.id(), change.removed) {
        debug!(conn = %session.id(), error = %e, "partner remove rejected");
        return deny(&session, &request, Code::PartnerRemoveDenied).await;
    }
    session
        .messager()
        .reply(request.id, Code::PartnerRemoveAccept, &Empty)
        .await
}

// ---------------------------------------------------------------------------
// Both ends
// ---------------------------------------------------------------------------

async fn client_mark<C, H>(session: Arc<Session<C>>, hooks: Arc<H>, request: Request) -> HandlerResult
where
    C: Connection,
    H: Propagation,
{
    if !trusted(&session) {
        warn!(conn = %session.id(), peer = %session.peer_addr(), "CLIENT_MARK before HELLO");
        return deny(&session, &request, Code::ClientMarkDenied).await;
    }
    let mark: ClientMark = match request.parse() {
        Ok(mark) => mark,
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "malformed CLIENT_MARK");
            return deny(&session, &request, Code::ClientMarkDenied).await;
        }
    };

    debug!(conn = %session.id(), clients = mark.records.len(), "clients marked by peer");
    if let Err(e) = hooks.mark_clients(session.id(), mark.records) {
        debug!(conn = %session.id(), error = %e, "client mark rejected");
        return deny(&session, &request, Code::ClientMarkDenied).await;
    }
    session
        .messager()
        .reply(request.id, Code::ClientMarkAccept, &Empty)
        .await
}

async fn client_unmark<C, H>(
    session: Arc<Session<C>>,
    hooks: Arc<H>,
    request: Request,
) -> HandlerResult
where
    C: Connection,
    H: Propagation,
{
    if !trusted(&session) {
        warn!(conn = %session.id(), peer = %session.peer_addr(), "CLIENT_UNMARK before HELLO");
        return deny(&session, &request, Code::ClientUnmarkDenied).await;
    }
    let unmark: ClientUnmark = match request.parse() {
        Ok(unmark) => unmark,
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "malformed CLIENT_UNMARK");
            return deny(&session, &request, Code::ClientUnmarkDenied).await;
        }
    };

    debug!(conn = %session.id(), clients = unmark.ips.len(), "clients unmarked by peer");
    if let Err(e) = hooks.unmark_clients(session.id(), unmark.ips) {
        debug!(conn = %session.id(), error = %e, "client unmark rejected");
        return deny(&session, &request, Code::ClientUnmarkDenied).await;
    }
    session
        .messager()
        .reply(request.id, Code::ClientUnmarkAccept, &Empty)
        .await
}
