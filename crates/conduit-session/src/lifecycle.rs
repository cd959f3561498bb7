//! Per-connection handshake and teardown state machine.
//!
//! ```text
//! uninitialized --initialize--> initializing --initialized--> ready
//! (any state) --initiate_shutdown--> shutting_down
//! ```
//!
//! Both transports share this type; nothing else decides whether a
//! connection is usable.

use conduit_core::protocol::methods;
use conduit_core::{
    ErrorObject, Implementation, InitializeParams, InitializeResult, Message, ServerDescriptor,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No `initialize` received yet.
    Uninitialized,
    /// `initialize` answered, waiting for the acknowledgement.
    Initializing,
    /// Handshake complete; every method is admissible.
    Ready,
    /// Teardown started; every method is rejected.
    ShuttingDown,
}

/// What the peer told us about itself during `initialize`.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Peer name and version.
    pub identity: Option<Implementation>,
    /// Peer capability set, kept opaque.
    pub capabilities: Option<Value>,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    peer: PeerInfo,
}

/// The lifecycle state machine for one connection or session.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    /// A fresh lifecycle in [`ConnectionState::Uninitialized`].
    pub fn new() -> Self {
        Self::with_state(ConnectionState::Uninitialized)
    }

    /// A lifecycle that is already [`ConnectionState::Ready`].
    ///
    /// Used for the synthetic per-request sessions of stateless HTTP.
    pub fn ready() -> Self {
        Self::with_state(ConnectionState::Ready)
    }

    fn with_state(state: ConnectionState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                peer: PeerInfo::default(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Peer identity and capabilities recorded by `initialize`.
    pub fn peer(&self) -> PeerInfo {
        self.inner.lock().peer.clone()
    }

    /// Decides whether `message` may execute in the current state.
    ///
    /// Responses carry no method and are admitted only once ready.
    pub fn check_admission(&self, message: &Message) -> Result<(), ErrorObject> {
        let state = self.state();
        let method = message.method();
        match (state, method) {
            (ConnectionState::ShuttingDown, _) => Err(ErrorObject::shutting_down()),
            (ConnectionState::Ready, _) => Ok(()),
            (ConnectionState::Uninitialized, Some(methods::INITIALIZE))
                if message.is_request() =>
            {
                Ok(())
            }
            (ConnectionState::Initializing, Some(methods::INITIALIZED))
                if message.is_notification() =>
            {
                Ok(())
            }
            _ => Err(ErrorObject::not_initialized()),
        }
    }

    /// Runs the `initialize` step of the handshake.
    ///
    /// Only legal from `uninitialized`. The requested version must equal
    /// [`PROTOCOL_VERSION`] exactly; a mismatch fails the handshake and
    /// leaves the state unchanged.
    pub fn handle_initialize(
        &self,
        params: Option<&Map<String, Value>>,
        server: &ServerDescriptor,
    ) -> Result<InitializeResult, ErrorObject> {
        let params: InitializeParams = match params {
            Some(p) => serde_json::from_value(Value::Object(p.clone()))
                .map_err(|e| ErrorObject::invalid_params(e.to_string()))?,
            None => return Err(ErrorObject::invalid_params("initialize requires params")),
        };

        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Uninitialized {
            return Err(ErrorObject::invalid_request("connection already initialized"));
        }

        if params.protocol_version != PROTOCOL_VERSION {
            debug!(
                requested = %params.protocol_version,
                supported = PROTOCOL_VERSION,
                "Rejected initialize with unsupported protocol version"
            );
            return Err(ErrorObject::new(
                conduit_core::codes::INVALID_REQUEST,
                "Unsupported protocol version",
            )
            .with_data(serde_json::json!({
                "supported": [PROTOCOL_VERSION],
                "received": params.protocol_version,
            })));
        }

        inner.peer = PeerInfo {
            identity: params.client_info,
            capabilities: Some(params.capabilities),
        };
        inner.state = ConnectionState::Initializing;

        if let Some(client) = &inner.peer.identity {
            info!(client = %client.name, version = %client.version, "Peer initializing");
        }
        Ok(server.initialize_result())
    }

    /// Applies the `notifications/initialized` acknowledgement.
    pub fn handle_initialized_ack(&self) -> Result<(), ErrorObject> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Initializing => {
                inner.state = ConnectionState::Ready;
                debug!("Connection ready");
                Ok(())
            }
            ConnectionState::ShuttingDown => Err(ErrorObject::shutting_down()),
            _ => Err(ErrorObject::not_initialized()),
        }
    }

    /// Moves to `shutting_down`.
    ///
    /// Returns `true` for the caller that performed the transition and
    /// `false` for every later caller.
    pub fn initiate_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::ShuttingDown {
            return false;
        }
        inner.state = ConnectionState::ShuttingDown;
        true
    }

    /// Returns to `uninitialized` and forgets the peer.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Uninitialized;
        inner.peer = PeerInfo::default();
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{codes, Notification, Request, Response, RequestId};
    use serde_json::json;

    fn init_params(version: &str) -> Map<String, Value> {
        json!({
            "protocolVersion": version,
            "capabilities": {"sampling": {}},
            "clientInfo": {"name": "tester", "version": "0.0.1"}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn request(method: &str) -> Message {
        Message::from(Request::new(1, method, None))
    }

    fn notification(method: &str) -> Message {
        Message::from(Notification::new(method, None))
    }

    fn server() -> ServerDescriptor {
        ServerDescriptor::new("srv", "1.0")
    }

    #[test]
    fn full_handshake() {
        let lc = Lifecycle::new();
        let result = lc
            .handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(lc.state(), ConnectionState::Initializing);
        assert_eq!(lc.peer().identity.unwrap().name, "tester");

        lc.handle_initialized_ack().unwrap();
        assert_eq!(lc.state(), ConnectionState::Ready);
    }

    #[test]
    fn version_mismatch_is_fatal_and_reports_versions() {
        let lc = Lifecycle::new();
        let err = lc
            .handle_initialize(Some(&init_params("2024-11-05")), &server())
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);
        let data = err.data.unwrap();
        assert_eq!(data["received"], "2024-11-05");
        assert_eq!(data["supported"][0], PROTOCOL_VERSION);
        assert_eq!(lc.state(), ConnectionState::Uninitialized);
    }

    #[test]
    fn initialize_twice_fails() {
        let lc = Lifecycle::new();
        lc.handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .unwrap();
        assert!(lc
            .handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .is_err());
    }

    #[test]
    fn initialize_without_params_is_invalid_params() {
        let lc = Lifecycle::new();
        let err = lc.handle_initialize(None, &server()).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[test]
    fn ack_before_initialize_is_rejected() {
        let lc = Lifecycle::new();
        assert_eq!(
            lc.handle_initialized_ack().unwrap_err().code,
            codes::NOT_INITIALIZED
        );
    }

    #[test]
    fn admission_per_state() {
        let lc = Lifecycle::new();
        assert!(lc.check_admission(&request(methods::INITIALIZE)).is_ok());
        assert!(lc.check_admission(&request("tools/list")).is_err());
        assert!(lc.check_admission(&notification(methods::INITIALIZED)).is_err());

        lc.handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .unwrap();
        assert!(lc.check_admission(&notification(methods::INITIALIZED)).is_ok());
        assert!(lc.check_admission(&request(methods::INITIALIZE)).is_err());
        assert!(lc.check_admission(&request(methods::PING)).is_err());

        lc.handle_initialized_ack().unwrap();
        assert!(lc.check_admission(&request("tools/call")).is_ok());
        assert!(lc
            .check_admission(&Message::from(Response::success(RequestId::Number(1), json!({}))))
            .is_ok());
    }

    #[test]
    fn shutting_down_rejects_everything() {
        let lc = Lifecycle::ready();
        assert!(lc.initiate_shutdown());
        for msg in [
            request(methods::INITIALIZE),
            request("tools/call"),
            notification(methods::INITIALIZED),
        ] {
            assert_eq!(lc.check_admission(&msg).unwrap_err().code, codes::SHUTTING_DOWN);
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let lc = Lifecycle::new();
        assert!(lc.initiate_shutdown());
        assert!(!lc.initiate_shutdown());
        assert!(!lc.initiate_shutdown());
        assert_eq!(lc.state(), ConnectionState::ShuttingDown);
    }

    #[test]
    fn reset_allows_retrying_the_handshake() {
        let lc = Lifecycle::new();
        lc.handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .unwrap();
        lc.reset();
        assert_eq!(lc.state(), ConnectionState::Uninitialized);
        assert!(lc.peer().identity.is_none());
        lc.handle_initialize(Some(&init_params(PROTOCOL_VERSION)), &server())
            .unwrap();
        assert_eq!(lc.state(), ConnectionState::Initializing);
    }
}
