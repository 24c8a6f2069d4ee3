//! Debug inspector.
//!
//! A TCP listener on the loopback interface. A single client may attach;
//! executions wait for it before running and then stream line-delimited JSON
//! events (execution start, console output, settlement) to it.

use std::io::{BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use serde::Serialize;
use weft_core::Level;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InspectorEvent {
    Execute {
        artifact: String,
        export: String,
        epoch: u64,
    },
    Console {
        level: Level,
        text: String,
    },
    Settled {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug)]
pub(crate) struct Inspector {
    listener: TcpListener,
    port: u16,
    client: Option<BufWriter<TcpStream>>,
}

/// Bind the inspector socket on `127.0.0.1:port`. Port 0 picks a free port.
pub(crate) fn listen(port: u16) -> Result<TcpListener, RuntimeError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr).map_err(|e| RuntimeError::Inspector(e.to_string()))?;
    tracing::info!(port = local_port(&listener)?, "Debug inspector listening");
    Ok(listener)
}

pub(crate) fn local_port(listener: &TcpListener) -> Result<u16, RuntimeError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| RuntimeError::Inspector(e.to_string()))
}

impl Inspector {
    /// An inspector accepting on a clone of `listener`. The socket stays
    /// bound for as long as any clone is alive.
    pub(crate) fn attach(listener: &TcpListener) -> Result<Self, RuntimeError> {
        let listener = listener
            .try_clone()
            .map_err(|e| RuntimeError::Inspector(e.to_string()))?;
        let port = local_port(&listener)?;
        Ok(Self {
            listener,
            port,
            client: None,
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Block until a client is attached. Returns immediately if one already is.
    pub(crate) fn wait_for_client(&mut self) -> Result<(), RuntimeError> {
        if self.client.is_some() {
            return Ok(());
        }
        tracing::info!(port = self.port, "Waiting for debugger to attach");
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| RuntimeError::Inspector(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        tracing::info!(peer = %peer, "Debugger attached");
        self.client = Some(BufWriter::new(stream));
        Ok(())
    }

    /// Send one event. A broken connection detaches the client; the next
    /// execution waits for a new one.
    pub(crate) fn emit(&mut self, event: &InspectorEvent) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *client, event)
            .map_err(std::io::Error::from)
            .and_then(|()| client.write_all(b"\n"))
            .and_then(|()| client.flush());
        if let Err(e) = written {
            tracing::warn!(error = %e, "Debugger connection lost");
            self.client = None;
        }
    }
}
