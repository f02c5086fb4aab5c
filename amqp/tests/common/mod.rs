//! In-memory broker used by the integration tests.
//!
//! `FakeTransport` hands out a `FakeEngine` whose sessions and links record
//! every call on a shared `Broker`, so tests can script CBS and management
//! replies and assert on what went over the "wire".

#![allow(dead_code)]

use amqp::auth::SharedAccessKeyCredential;
use amqp::common::{AmqpError, AmqpResult};
use amqp::config::ConnectionOptions;
use amqp::connection_manager::{AmqpConnection, ConnectionState};
use amqp::observer::ConnectionObserver;
use amqp::transport::{
    AmqpRequest, AmqpResponse, ConnectionHandler, ConnectionParameters, EndpointState,
    ProtocolEngine, RequestResponseLink, ResponseCode, SessionEndpoint, SessionHandler, Transport,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "contoso.servicebus.windows.net";

/// Validity of tokens issued by [`credential`]
pub const TOKEN_VALIDITY_SECS: i64 = 600;

pub fn options() -> ConnectionOptions {
    ConnectionOptions::new(NAMESPACE)
}

pub fn credential() -> Arc<SharedAccessKeyCredential> {
    Arc::new(SharedAccessKeyCredential::new(
        "RootManageSharedAccessKey",
        "dGVzdC1rZXk=",
        chrono::Duration::seconds(TOKEN_VALIDITY_SECS),
    ))
}

pub fn connect(transport: &Arc<FakeTransport>) -> AmqpConnection {
    AmqpConnection::new(options(), transport.clone(), credential())
        .expect("connection should build inside a runtime")
}

/// Wait until the connection state satisfies `predicate`.
pub async fn wait_for_state(
    connection: &AmqpConnection,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut receiver = connection.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = receiver.borrow_and_update().clone();
            if predicate(&state) {
                return state;
            }
            if receiver.changed().await.is_err() {
                return receiver.borrow().clone();
            }
        }
    })
    .await
    .expect("connection did not reach the expected state")
}

/// Everything the fake engine, sessions and links observed.
#[derive(Default)]
pub struct Broker {
    pub connects: AtomicUsize,
    pub sessions_begun: AtomicUsize,
    pub sessions_ended: AtomicUsize,
    pub links_closed: AtomicUsize,
    pub fail_session_end: AtomicBool,
    pub fail_session_begin: AtomicBool,
    session_names: Mutex<Vec<String>>,
    link_addresses: Mutex<Vec<String>>,
    requests: Mutex<Vec<AmqpRequest>>,
    cbs_codes: Mutex<VecDeque<ResponseCode>>,
    management_code: Mutex<Option<ResponseCode>>,
    management_properties: Mutex<HashMap<String, String>>,
    handler: Mutex<Option<ConnectionHandler>>,
}

impl Broker {
    /// Queue status codes for the next put-token requests; 202 once exhausted
    pub fn script_cbs(&self, codes: impl IntoIterator<Item = ResponseCode>) {
        self.cbs_codes.lock().unwrap().extend(codes);
    }

    pub fn reply_to_management(&self, code: ResponseCode, properties: &[(&str, &str)]) {
        *self.management_code.lock().unwrap() = Some(code);
        *self.management_properties.lock().unwrap() = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn session_names(&self) -> Vec<String> {
        self.session_names.lock().unwrap().clone()
    }

    pub fn link_addresses(&self) -> Vec<String> {
        self.link_addresses.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<AmqpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn put_tokens(&self) -> Vec<AmqpRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.operation == "put-token")
            .collect()
    }

    /// Report an endpoint transition as the protocol engine would
    pub fn emit(&self, state: EndpointState) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler.on_endpoint_state(state);
        }
    }

    pub fn emit_error(&self, error: AmqpError) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler.on_error(error);
        }
    }

    /// Drop the connection handler, ending its event stream
    pub fn drop_handler(&self) {
        self.handler.lock().unwrap().take();
    }

    fn record(&self, request: AmqpRequest) -> AmqpResponse {
        let operation = request.operation.clone();
        self.requests.lock().unwrap().push(request);

        if operation == "put-token" {
            let code = self
                .cbs_codes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ResponseCode::Accepted);
            return AmqpResponse::new(code).with_description(code.to_string());
        }

        let code = self
            .management_code
            .lock()
            .unwrap()
            .unwrap_or(ResponseCode::Ok);
        let mut response = AmqpResponse::new(code);
        for (key, value) in self.management_properties.lock().unwrap().iter() {
            response = response.with_property(key.clone(), value.clone());
        }
        response
    }
}

/// Transport creating one [`FakeEngine`] per connect call.
pub struct FakeTransport {
    broker: Arc<Broker>,
    connect_delay: Duration,
    begin_delay: Duration,
    connect_error: Option<AmqpError>,
    activate: bool,
    run_error: Option<AmqpError>,
    parameters: Mutex<Option<ConnectionParameters>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker::default()),
            connect_delay: Duration::ZERO,
            begin_delay: Duration::ZERO,
            connect_error: None,
            activate: true,
            run_error: None,
            parameters: Mutex::new(None),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Every session takes `delay` to begin
    pub fn with_begin_delay(mut self, delay: Duration) -> Self {
        self.begin_delay = delay;
        self
    }

    pub fn with_connect_error(mut self, error: AmqpError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// The engine never reports the connection as active
    pub fn without_activation(mut self) -> Self {
        self.activate = false;
        self
    }

    pub fn with_run_error(mut self, error: AmqpError) -> Self {
        self.run_error = Some(error);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    pub fn last_parameters(&self) -> Option<ConnectionParameters> {
        self.parameters.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        parameters: &ConnectionParameters,
        handler: ConnectionHandler,
    ) -> AmqpResult<Arc<dyn ProtocolEngine>> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        *self.parameters.lock().unwrap() = Some(parameters.clone());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(error) = self.connect_error.clone() {
            return Err(error);
        }

        handler.on_endpoint_state(EndpointState::Opening);
        *self.broker.handler.lock().unwrap() = Some(handler);

        Ok(Arc::new(FakeEngine {
            broker: self.broker.clone(),
            activate: self.activate,
            begin_delay: self.begin_delay,
            run_error: self.run_error.clone(),
        }))
    }
}

pub struct FakeEngine {
    broker: Arc<Broker>,
    activate: bool,
    begin_delay: Duration,
    run_error: Option<AmqpError>,
}

#[async_trait]
impl ProtocolEngine for FakeEngine {
    async fn run(&self, shutdown: CancellationToken) -> AmqpResult<()> {
        if self.activate {
            self.broker.emit(EndpointState::Active);
        }
        if let Some(error) = self.run_error.clone() {
            return Err(error);
        }
        shutdown.cancelled().await;
        Ok(())
    }

    async fn begin_session(
        &self,
        name: &str,
        handler: SessionHandler,
    ) -> AmqpResult<Arc<dyn SessionEndpoint>> {
        if !self.begin_delay.is_zero() {
            tokio::time::sleep(self.begin_delay).await;
        }
        if self.broker.fail_session_begin.load(Ordering::SeqCst) {
            return Err(AmqpError::transient("session begin refused"));
        }
        self.broker.sessions_begun.fetch_add(1, Ordering::SeqCst);
        self.broker.session_names.lock().unwrap().push(name.to_string());
        handler.on_endpoint_state(EndpointState::Active);

        Ok(Arc::new(FakeSession {
            broker: self.broker.clone(),
        }))
    }
}

pub struct FakeSession {
    broker: Arc<Broker>,
}

#[async_trait]
impl SessionEndpoint for FakeSession {
    async fn open_request_response(
        &self,
        address: &str,
    ) -> AmqpResult<Arc<dyn RequestResponseLink>> {
        self.broker
            .link_addresses
            .lock()
            .unwrap()
            .push(address.to_string());
        Ok(Arc::new(FakeLink {
            broker: self.broker.clone(),
        }))
    }

    async fn end(&self) -> AmqpResult<()> {
        self.broker.sessions_ended.fetch_add(1, Ordering::SeqCst);
        if self.broker.fail_session_end.load(Ordering::SeqCst) {
            return Err(AmqpError::fatal("session end rejected"));
        }
        Ok(())
    }
}

pub struct FakeLink {
    broker: Arc<Broker>,
}

#[async_trait]
impl RequestResponseLink for FakeLink {
    async fn request(&self, request: AmqpRequest) -> AmqpResult<AmqpResponse> {
        Ok(self.broker.record(request))
    }

    async fn close(&self) -> AmqpResult<()> {
        self.broker.links_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer recording every hook as a readable line.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_session_opened(&self, _connection_id: &str, session_name: &str) {
        self.push(format!("opened:{session_name}"));
    }

    fn on_session_closed(&self, _connection_id: &str, session_name: &str) {
        self.push(format!("closed:{session_name}"));
    }

    fn on_authorization_succeeded(&self, audience: &str, _next_refresh: Duration) {
        self.push(format!("authorized:{audience}"));
    }

    fn on_authorization_failed(&self, audience: &str, _error: &AmqpError) {
        self.push(format!("rejected:{audience}"));
    }
}
