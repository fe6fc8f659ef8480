use crate::auth::Auth;
use crate::models::file::FileStorage;
use crate::queue::{Grader, RunDispatcher};
use crate::registry::Server;
use crate::store::Store;
use std::sync::Arc;

/// Process wide state, built once at startup and shared by every request.
#[derive(Clone)]
pub struct Context {
    pub server: Server,
    pub auth: Auth,
    pub dispatcher: RunDispatcher,
}

impl Context {
    /// Must be called from within a tokio runtime, the run workers are
    /// spawned onto it.
    pub fn new(
        store: Arc<dyn Store>,
        files: FileStorage,
        secret_hash_key: &[u8],
        grader: Arc<dyn Grader>,
        workers: usize,
    ) -> Self {
        let server = Server::new(store.clone(), files);
        let auth = Auth::new(store, secret_hash_key);
        let dispatcher = RunDispatcher::start(server.clone(), grader, workers);
        Context {
            server,
            auth,
            dispatcher,
        }
    }
}
