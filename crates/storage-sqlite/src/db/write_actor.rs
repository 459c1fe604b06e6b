//! Single-writer actor.
//!
//! SQLite allows one writer at a time; funneling every mutation through one
//! dedicated thread removes lock contention and gives each job its own
//! immediate transaction, so a job either commits whole or leaves no trace.

use diesel::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot};

use aula_core::errors::{DatabaseError, Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type WriteJob = Box<dyn FnOnce(&mut SqliteConnection) + Send>;

/// Transaction error wrapper so application errors roll the transaction back
/// without losing their type.
enum TxError {
    App(Error),
    Db(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Db(err)
    }
}

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteHandle {
    /// Run `job` inside an immediate transaction on the writer thread.
    ///
    /// Any error returned by the job rolls the transaction back and is
    /// propagated to the caller unchanged.
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: WriteJob = Box::new(move |conn| {
            let result = conn
                .immediate_transaction::<_, TxError, _>(|tx| job(tx).map_err(TxError::App))
                .map_err(|err| match err {
                    TxError::App(app) => app,
                    TxError::Db(db) => StorageError::from(db).into(),
                });
            let _ = reply_tx.send(result);
        });

        self.tx.send(wrapped).map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Write actor is no longer running".to_string(),
            ))
        })?;

        reply_rx.await.map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Write actor dropped the job before replying".to_string(),
            ))
        })?
    }
}

/// Spawn the writer thread. Jobs run strictly in submission order.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();

    std::thread::spawn(move || {
        while let Some(job) = rx.blocking_recv() {
            match pool.get() {
                Ok(mut conn) => job(&mut conn),
                Err(err) => {
                    // Dropping the job closes its reply channel; the caller
                    // observes a writer failure.
                    log::error!("Write actor could not check out a connection: {}", err);
                    drop(job);
                }
            }
        }
    });

    WriteHandle { tx }
}
