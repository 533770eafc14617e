//! MariaDB adapter.
//!
//! Shares the MySQL session implementation. MariaDB additionally reports
//! killed and idle-timed-out sessions with its own codes, and supports
//! `RETURNING` on INSERT and DELETE.

use std::borrow::Cow;

use async_trait::async_trait;

use super::mysql::{open, Flavor};
use super::{Adapter, Connection};
use crate::backend::{BackendDescriptor, BackendKind, ConnectString};
use crate::error::AdapterError;
use crate::statement::append_returning;

/// Connection was killed.
const ER_CONNECTION_KILLED: u16 = 1927;
/// Session closed after exceeding the idle timeout.
const ER_CLIENT_INTERACTION_TIMEOUT: u16 = 4031;

/// MariaDB-only server codes that end the session.
pub(super) fn is_fatal_server_code(code: u16) -> bool {
    matches!(code, ER_CONNECTION_KILLED | ER_CLIENT_INTERACTION_TIMEOUT)
}

/// Adapter for MariaDB backends.
pub struct MariaDbAdapter {
    backend_id: String,
    connect: ConnectString,
}

impl MariaDbAdapter {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            backend_id: descriptor.id.clone(),
            connect: descriptor.connect.clone(),
        }
    }
}

#[async_trait]
impl Adapter for MariaDbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::MariaDb
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        open(&self.backend_id, &self.connect, Flavor::MariaDb).await
    }

    fn prepare_write<'s>(&self, statement: &'s str) -> Cow<'s, str> {
        append_returning(statement, &["INSERT", "DELETE"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MariaDbAdapter {
        MariaDbAdapter::new(&BackendDescriptor::new(
            "maria",
            BackendKind::MariaDb,
            "mysql://localhost/app",
        ))
    }

    #[test]
    fn test_prepare_write_insert_and_delete_only() {
        let adapter = adapter();
        assert_eq!(
            adapter.prepare_write("INSERT INTO t VALUES (?);"),
            "INSERT INTO t VALUES (?) RETURNING *"
        );
        assert_eq!(
            adapter.prepare_write("DELETE FROM t WHERE id = ?"),
            "DELETE FROM t WHERE id = ? RETURNING *"
        );
        assert_eq!(
            adapter.prepare_write("UPDATE t SET a = ?"),
            "UPDATE t SET a = ?"
        );
    }

    #[test]
    fn test_mariadb_only_codes() {
        assert!(is_fatal_server_code(1927));
        assert!(is_fatal_server_code(4031));
        assert!(!is_fatal_server_code(1053));
    }
}
