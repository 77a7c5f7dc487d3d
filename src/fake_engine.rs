//! Scripted, recording engine for unit tests.

use crate::config::Protocol;
use crate::engine::{Engine, EngineError, EngineErrorKind, EngineResult, Role};
use crate::output::OutputHandle;
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NewSession,
    ApplyDefaults,
    SetRole(Role),
    SetProtocol(Protocol),
    SetInterval(u64),
    SetDuration(u64),
    SetBlockSize(u64),
    SetByteLimit(u64),
    SetBlockCount(u64),
    SetTarget(String, u16),
    SetListenPort(u16),
    BindOutput(i32),
    EnableJson,
    RunClient,
    RunServer,
    Release,
}

#[derive(Debug)]
pub struct FakeSession {
    released: bool,
}

/// Records every call. Run results are popped from a script; an exhausted
/// script means success.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<Call>>,
    fail_new_session: bool,
    bind_error: Option<i32>,
    client_results: Mutex<VecDeque<EngineResult<()>>>,
    server_results: Mutex<VecDeque<EngineResult<()>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_new_session(mut self) -> Self {
        self.fail_new_session = true;
        self
    }

    pub fn failing_bind(mut self, errno: i32) -> Self {
        self.bind_error = Some(errno);
        self
    }

    /// Client runs report "connection refused" `times` times before `then`.
    pub fn refusing_client(self, times: usize, then: EngineResult<()>) -> Self {
        {
            let mut script = self.client_results.lock().unwrap();
            for _ in 0..times {
                script.push_back(Err(refused()));
            }
            script.push_back(then);
        }
        self
    }

    pub fn with_server_result(self, result: EngineResult<()>) -> Self {
        self.server_results.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn created(&self) -> usize {
        self.count(&Call::NewSession)
    }

    pub fn released(&self) -> usize {
        self.count(&Call::Release)
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn refused() -> EngineError {
    EngineError::with_detail(EngineErrorKind::ConnectRefused, "Connection refused (os error 111)")
}

impl Engine for FakeEngine {
    type Session = FakeSession;

    fn new_session(&self) -> EngineResult<FakeSession> {
        if self.fail_new_session {
            return Err(EngineError::new(EngineErrorKind::SessionInit));
        }
        self.push(Call::NewSession);
        Ok(FakeSession { released: false })
    }

    fn apply_defaults(&self, _session: &mut FakeSession) {
        self.push(Call::ApplyDefaults);
    }

    fn set_role(&self, _session: &mut FakeSession, role: Role) {
        self.push(Call::SetRole(role));
    }

    fn set_protocol(&self, _session: &mut FakeSession, protocol: Protocol) {
        self.push(Call::SetProtocol(protocol));
    }

    fn set_interval(&self, _session: &mut FakeSession, secs: u64) {
        self.push(Call::SetInterval(secs));
    }

    fn set_duration(&self, _session: &mut FakeSession, secs: u64) {
        self.push(Call::SetDuration(secs));
    }

    fn set_block_size(&self, _session: &mut FakeSession, bytes: u64) {
        self.push(Call::SetBlockSize(bytes));
    }

    fn set_byte_limit(&self, _session: &mut FakeSession, bytes: u64) {
        self.push(Call::SetByteLimit(bytes));
    }

    fn set_block_count(&self, _session: &mut FakeSession, blocks: u64) {
        self.push(Call::SetBlockCount(blocks));
    }

    fn set_target(&self, _session: &mut FakeSession, host: &str, port: u16) {
        self.push(Call::SetTarget(host.to_string(), port));
    }

    fn set_listen_port(&self, _session: &mut FakeSession, port: u16) {
        self.push(Call::SetListenPort(port));
    }

    fn bind_output(&self, _session: &mut FakeSession, output: OutputHandle) -> io::Result<()> {
        self.push(Call::BindOutput(output.raw_fd()));
        match self.bind_error {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn enable_json_output(&self, _session: &mut FakeSession) {
        self.push(Call::EnableJson);
    }

    fn run_client(&self, session: &mut FakeSession) -> EngineResult<()> {
        assert!(!session.released, "run on a released session");
        self.push(Call::RunClient);
        self.client_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn run_server(&self, session: &mut FakeSession) -> EngineResult<()> {
        assert!(!session.released, "run on a released session");
        self.push(Call::RunServer);
        self.server_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn release_session(&self, mut session: FakeSession) {
        assert!(!session.released, "session released twice");
        session.released = true;
        self.push(Call::Release);
    }
}
