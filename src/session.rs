//! Projection of a configuration onto an engine session.

use crate::config::{ClientConfig, ServerConfig};
use crate::engine::{Engine, Role};
use crate::error::{Error, Result};
use crate::output::OutputHandle;
use log::debug;

/// The configuration a session is built from.
#[derive(Debug, Clone, Copy)]
pub enum SessionConfig<'a> {
    Client(&'a ClientConfig),
    Server(&'a ServerConfig),
}

impl SessionConfig<'_> {
    pub fn role(&self) -> Role {
        match self {
            SessionConfig::Client(_) => Role::Client,
            SessionConfig::Server(_) => Role::Server,
        }
    }
}

/// Applies engine defaults, the role and then the role's settings.
///
/// Sentinel fields (zero) are skipped so the engine keeps its default.
/// Target host/port and the listen port are always forwarded.
pub fn configure<E: Engine>(engine: &E, session: &mut E::Session, config: SessionConfig<'_>) {
    engine.apply_defaults(session);
    engine.set_role(session, config.role());

    match config {
        SessionConfig::Client(cfg) => {
            engine.set_protocol(session, cfg.protocol);
            if cfg.test.measurement_interval > 0 {
                engine.set_interval(session, cfg.test.measurement_interval);
            }
            if cfg.duration_secs > 0 {
                engine.set_duration(session, cfg.duration_secs);
            }
            if cfg.buffer_size > 0 {
                engine.set_block_size(session, cfg.buffer_size);
            }
            if cfg.bytes > 0 {
                engine.set_byte_limit(session, cfg.bytes);
            }
            if cfg.packets > 0 {
                engine.set_block_count(session, cfg.packets);
            }
            engine.set_target(session, &cfg.target_host, cfg.target_port);
        }
        SessionConfig::Server(cfg) => {
            if cfg.test.measurement_interval > 0 {
                engine.set_interval(session, cfg.test.measurement_interval);
            }
            engine.set_listen_port(session, cfg.listen_port);
        }
    }
}

/// Binds the caller's handle as the session output and turns on JSON results.
pub fn bind_output<E: Engine>(
    engine: &E,
    session: &mut E::Session,
    output: OutputHandle,
) -> Result<()> {
    engine.bind_output(session, output).map_err(Error::OutputBind)?;
    engine.enable_json_output(session);
    Ok(())
}

/// Owns a session for one runner invocation and releases it on drop.
pub(crate) struct SessionGuard<'e, E: Engine> {
    engine: &'e E,
    // Only emptied by `drop`.
    session: Option<E::Session>,
}

impl<'e, E: Engine> SessionGuard<'e, E> {
    pub(crate) fn open(engine: &'e E) -> Result<Self> {
        let session = engine.new_session()?;
        debug!("test session created");
        Ok(Self {
            engine,
            session: Some(session),
        })
    }

    pub(crate) fn session_mut(&mut self) -> &mut E::Session {
        self.session
            .as_mut()
            .expect("session is held until the guard drops")
    }
}

impl<E: Engine> Drop for SessionGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.engine.release_session(session);
            debug!("test session released");
        }
    }
}
