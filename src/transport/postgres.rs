//! Postgres LISTEN/NOTIFY transport.
//!
//! The connection is a [`PgListener`] driven by a current-thread tokio
//! runtime that lives inside the transport, so the dispatcher thread stays a
//! plain blocking thread and remains the connection's only user.

use super::{check_payload, Connector, Notification, Transport, Wakeup};
use crate::error::{PubSubError, Result};
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// SQLSTATE for `invalid_parameter_value`, raised for oversized payloads.
const INVALID_PARAMETER_VALUE: &str = "22023";

/// Opens [`PgTransport`] connections to one database URL.
pub struct PgConnector {
    url: String,
    payload_limit: usize,
}

impl PgConnector {
    /// `payload_limit` is the largest NOTIFY payload sent; Postgres itself
    /// rejects anything from 8000 bytes up.
    pub fn new(url: impl Into<String>, payload_limit: usize) -> Self {
        Self {
            url: url.into(),
            payload_limit,
        }
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> Result<Box<dyn Transport>> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        let listener = runtime.block_on(PgListener::connect(&self.url))?;

        tracing::info!("connected to postgres for LISTEN/NOTIFY");
        Ok(Box::new(PgTransport {
            runtime,
            listener,
            payload_limit: self.payload_limit,
        }))
    }
}

/// One dedicated Postgres connection.
pub struct PgTransport {
    runtime: Runtime,
    listener: PgListener,
    payload_limit: usize,
}

impl Transport for PgTransport {
    fn listen(&mut self, channel: &str) -> Result<()> {
        self.runtime.block_on(self.listener.listen(channel))?;
        Ok(())
    }

    fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.runtime.block_on(self.listener.unlisten(channel))?;
        Ok(())
    }

    fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        check_payload(payload, self.payload_limit)?;

        let listener = &mut self.listener;
        let result = self.runtime.block_on(
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(payload)
                .execute(listener),
        );

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(INVALID_PARAMETER_VALUE) =>
            {
                Err(PubSubError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.payload_limit,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&mut self, wakeup: &Wakeup, timeout: Duration) -> Result<Vec<Notification>> {
        let listener = &mut self.listener;
        self.runtime.block_on(async {
            tokio::select! {
                received = listener.try_recv() => match received {
                    Ok(Some(n)) => Ok(vec![Notification {
                        channel: n.channel().to_string(),
                        payload: n.payload().to_string(),
                    }]),
                    // try_recv reports a lost connection as None.
                    Ok(None) => Err(PubSubError::Connection(
                        "postgres listener connection lost".to_string(),
                    )),
                    Err(e) => Err(PubSubError::from(e)),
                },
                _ = wakeup.notified() => Ok(Vec::new()),
                _ = tokio::time::sleep(timeout) => Ok(Vec::new()),
            }
        })
    }
}
