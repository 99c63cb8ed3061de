//! Optional transactional boundary around a commit.

use crate::error::Result;

/// Connection whose transaction brackets a unit-of-work commit.
///
/// The entity manager never inspects what the connection does; atomicity of
/// the adapter calls issued in between is the connection's responsibility.
pub trait TransactionalConnection: Send + Sync {
    fn begin_transaction(&self) -> Result<()>;

    fn commit_transaction(&self) -> Result<()>;

    fn rollback_transaction(&self) -> Result<()>;
}
