//! Progress thread
//!
//! The [`GdsContext`] lives on one dedicated thread running a
//! current-thread runtime. Callers on other threads post closures over an
//! unbounded channel and wait on a one-shot reply, so modules never see
//! concurrent access.
//!
//! ```text
//!  caller ──job──> mpsc ──> gds-progress thread ──> GdsContext
//!    ^                                                  |
//!    └────────────────────── oneshot <──────────────────┘
//! ```
//!
//! Every posted request completes: if the loop is gone, or a request
//! panics, the caller gets [`Error::Unreachable`].

use crate::context::GdsContext;
use crate::env::GdsEnv;
use gds_common::{Error, Info, KeyValue, ProcId, Result, Scope};
use std::thread::JoinHandle;
use tokio::runtime::Builder;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce(&mut GdsContext) + Send>;

fn lost() -> Error {
    Error::Unreachable("progress loop is not running".into())
}

/// Handle to the thread that owns the context
pub struct ProgressThread {
    tx: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressThread {
    /// Start the loop and build the context on it
    pub fn spawn(env: GdsEnv) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("gds-progress".into())
            .spawn(move || run_loop(env, rx, ready_tx))?;

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => Ok(Self {
                tx: Some(tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Unreachable("progress thread died during startup".into()))
            }
        }
    }

    fn post<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut GdsContext) -> Result<T> + Send + 'static,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        });
        self.tx
            .as_ref()
            .ok_or_else(lost)?
            .send(job)
            .map_err(|_| lost())?;
        Ok(reply_rx)
    }

    /// Run `f` on the loop and block until it finishes
    ///
    /// Must not be called from the loop itself or from inside an async
    /// runtime; use [`Self::call_async`] there.
    pub fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut GdsContext) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        self.post(f)?.blocking_recv().map_err(|_| lost())?
    }

    /// Run `f` on the loop and await the result
    pub async fn call_async<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut GdsContext) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        self.post(f)?.await.map_err(|_| lost())?
    }

    /// Blocking store
    pub fn store(&self, proc: ProcId, scope: Scope, kv: KeyValue) -> Result<()> {
        self.call(move |ctx| ctx.store(&proc, scope, &kv))
    }

    /// Blocking fetch
    pub fn fetch(
        &self,
        proc: ProcId,
        scope: Scope,
        key: Option<String>,
        qualifiers: Vec<Info>,
    ) -> Result<Vec<KeyValue>> {
        self.call(move |ctx| ctx.fetch(&proc, scope, key.as_deref(), &qualifiers))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Stop the loop after the queued requests and wait for it
    pub fn shutdown(&mut self) {
        self.tx = None;
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("progress thread panicked");
        }
    }
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    env: GdsEnv,
    mut rx: mpsc::UnboundedReceiver<Job>,
    ready: oneshot::Sender<Result<()>>,
) {
    let rt = match Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot build progress runtime: {}", e);
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut ctx = match GdsContext::new(env) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    rt.block_on(async {
        while let Some(job) = rx.recv().await {
            job(&mut ctx);
        }
    });
    debug!("progress loop for {} exited", ctx.env().myid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Role;
    use crate::factory::ModuleKind;
    use gds_common::keys;
    use gds_common::{GdsConfig, Nspace, Rank, Value};

    fn spawn() -> ProgressThread {
        let mut config = GdsConfig::default();
        config.modules = vec!["hash".into()];
        let env = GdsEnv::with_hostname(
            config,
            ProcId::new("ns1", Rank::new(0)),
            Role::Client,
            "n0",
        );
        ProgressThread::spawn(env).unwrap()
    }

    #[test]
    fn test_blocking_round_trip() {
        let pt = spawn();
        assert!(pt.is_running());
        assert_eq!(pt.call(|ctx| Ok(ctx.own_module())).unwrap(), ModuleKind::Hash);

        let me = ProcId::new("ns1", Rank::new(0));
        pt.store(me.clone(), Scope::Global, KeyValue::new("user.ep", "tcp://a"))
            .unwrap();
        let got = pt
            .fetch(me, Scope::Undef, Some("user.ep".into()), Vec::new())
            .unwrap();
        assert_eq!(got[0].value, Value::from("tcp://a"));
    }

    #[test]
    fn test_errors_cross_the_thread() {
        let pt = spawn();
        let proc = ProcId::new("nsX", Rank::new(0));
        let err = pt
            .fetch(proc, Scope::Undef, Some(keys::JOB_SIZE.into()), Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNamespace(_)));
    }

    #[test]
    fn test_lost_loop_is_unreachable() {
        let mut pt = spawn();
        let err = pt.call::<()>(|_| panic!("request blew up")).unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        let err = pt.call(|ctx| Ok(ctx.own_module())).unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));

        pt.shutdown();
        assert!(!pt.is_running());
        assert!(matches!(pt.call(|_| Ok(())), Err(Error::Unreachable(_))));
    }

    #[test]
    fn test_async_caller() {
        let pt = spawn();
        let rt = Builder::new_current_thread().build().unwrap();
        let nspace = rt
            .block_on(pt.call_async(|ctx| {
                ctx.del_nspace(&Nspace::from("ns1"))?;
                Ok(ctx.env().myid.nspace.clone())
            }))
            .unwrap();
        assert_eq!(nspace, Nspace::from("ns1"));
    }
}
