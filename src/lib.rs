pub mod api;
pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod notifications;
pub mod persistence;
pub mod store;

use config::Config;
use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::lifecycle::{Accounts, SideTables};
use crate::notifications::Mailer;
use crate::persistence::SaveQueue;
use crate::store::DocumentStore;

pub struct AppState {
    pub config: Config,
    pub store: Arc<DocumentStore>,
    pub saver: SaveQueue,
    pub codes: Arc<SideTables>,
    pub tokens: TokenIssuer,
    pub accounts: Accounts,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<DocumentStore>,
        saver: SaveQueue,
        mailer: Arc<dyn Mailer>,
        tokens: TokenIssuer,
    ) -> Self {
        let codes = Arc::new(SideTables::default());
        let accounts = Accounts::new(
            store.clone(),
            saver.clone(),
            codes.clone(),
            mailer,
            tokens.clone(),
            config.auth.clone(),
        );
        Self {
            config,
            store,
            saver,
            codes,
            tokens,
            accounts,
        }
    }
}
