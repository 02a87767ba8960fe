//! Bounded connection pool: a mutex-guarded free list gated by a counting
//! semaphore sized to the pool capacity.
//!
//! Acquisition blocks on the semaphore (with a bounded timeout so a dead
//! database degrades into failed authentication instead of a stuck worker),
//! then takes a handle under the mutex. The returned [`PooledConn`] guard
//! puts the handle back and posts the semaphore on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::connection::{MysqlConfig, MysqlConnection};
use crate::error::{MysqlError, MysqlResult};

/// Counting semaphore over Mutex + Condvar.
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement, waiting up to `timeout`. Returns false on timeout.
    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap();
        let (mut guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |c| *c == 0)
            .unwrap();
        if result.timed_out() && *guard == 0 {
            return false;
        }
        *guard -= 1;
        true
    }

    fn post(&self) {
        let mut guard = self.count.lock().unwrap();
        *guard += 1;
        self.cond.notify_one();
    }
}

struct PoolInner {
    conns: Mutex<Vec<MysqlConnection>>,
    sem: Semaphore,
    acquire_timeout: Duration,
}

/// A bounded pool of MySQL connections, cheaply cloneable across threads.
#[derive(Clone)]
pub struct SqlPool {
    inner: Arc<PoolInner>,
}

impl SqlPool {
    /// Eagerly open `size` connections. Fails if any connection fails,
    /// so a misconfigured database is caught at startup.
    pub fn connect(config: &MysqlConfig, size: usize) -> MysqlResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            conns.push(MysqlConnection::connect(config)?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                sem: Semaphore::new(conns.len()),
                conns: Mutex::new(conns),
                acquire_timeout: Duration::from_secs(3),
            }),
        })
    }

    /// A pool with no connections: every acquire times out. Lets the server
    /// keep serving static files when the database is down at startup.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sem: Semaphore::new(0),
                conns: Mutex::new(Vec::new()),
                acquire_timeout: Duration::from_millis(100),
            }),
        }
    }

    /// Take a connection from the pool, blocking up to the acquire timeout.
    pub fn get(&self) -> MysqlResult<PooledConn> {
        if !self.inner.sem.acquire_timeout(self.inner.acquire_timeout) {
            return Err(MysqlError::PoolTimeout);
        }
        let conn = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.pop()
        };
        match conn {
            Some(conn) => Ok(PooledConn {
                conn: Some(conn),
                pool: Arc::clone(&self.inner),
            }),
            // The semaphore said a handle existed; a poisoned state here is
            // a bug, surface it as a closed connection rather than panic.
            None => {
                self.inner.sem.post();
                Err(MysqlError::ConnectionClosed)
            }
        }
    }

    /// Number of idle handles.
    pub fn free_count(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }
}

/// RAII guard for a pooled connection. Dereferences to [`MysqlConnection`];
/// returns the handle and posts the semaphore when dropped.
pub struct PooledConn {
    conn: Option<MysqlConnection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConn {
    type Target = MysqlConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.conns.lock().unwrap().push(conn);
            self.pool.sem.post();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_times_out() {
        let pool = SqlPool::empty();
        assert_eq!(pool.free_count(), 0);
        assert!(matches!(pool.get(), Err(MysqlError::PoolTimeout)));
    }

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2);
        assert!(sem.acquire_timeout(Duration::from_millis(10)));
        assert!(sem.acquire_timeout(Duration::from_millis(10)));
        assert!(!sem.acquire_timeout(Duration::from_millis(10)));
        sem.post();
        assert!(sem.acquire_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_semaphore_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = std::thread::spawn(move || sem2.acquire_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(handle.join().unwrap());
    }
}
