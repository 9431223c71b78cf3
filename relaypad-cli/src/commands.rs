use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use relaypad_collab::{
    color_for, derive_group_key, AppKind, CollabConfig, DocumentSession, Keys, ParticipantMode,
    RelayPool, RelaySet, SessionOptions, Signer, SnapshotKind,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::profiles::ProfileNames;
use crate::render;

const PROFILE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "relaypad", version, about = "Collaborate on documents over Nostr relays")]
pub struct Cli {
    /// JSON config file; defaults apply when it is missing
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Document relay, repeatable; replaces the configured list
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,

    /// Hex secret key for a personal identity
    #[arg(long, global = true, conflicts_with = "group")]
    secret: Option<String>,

    /// Shared passphrase; everyone using it signs with the same key
    #[arg(long, global = true)]
    group: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a document and print its contents and roster as they change
    Watch {
        #[arg(value_parser = parse_app)]
        app: AppKind,
        document: String,
        /// Display name announced to other participants
        #[arg(long, default_value = "relaypad-cli")]
        name: String,
    },
    /// Publish a snapshot of a document's current state
    Snapshot {
        document: String,
        #[arg(long, value_parser = parse_app, default_value = "editor")]
        app: AppKind,
        #[arg(long, value_enum, default_value_t = Kind::History)]
        kind: Kind,
        /// How long to wait for stored events before saving
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print the key a group passphrase derives to
    DeriveKey { passphrase: String },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Kind {
    History,
    Replaceable,
}

impl From<Kind> for SnapshotKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::History => SnapshotKind::History,
            Kind::Replaceable => SnapshotKind::Replaceable,
        }
    }
}

fn parse_app(s: &str) -> Result<AppKind, String> {
    s.parse().map_err(|e| format!("{e}"))
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Command::DeriveKey { passphrase } => {
                let keys = Keys::from_group_passphrase(passphrase)?;
                println!("secret  {}", hex::encode(derive_group_key(passphrase)));
                println!("pubkey  {}", keys.public_key());
                Ok(())
            }
            Command::Watch {
                app,
                document,
                name,
            } => self.watch(*app, document, name).await,
            Command::Snapshot {
                document,
                app,
                kind,
                timeout_secs,
            } => {
                self.snapshot(*app, document, (*kind).into(), Duration::from_secs(*timeout_secs))
                    .await
            }
        }
    }

    fn config(&self) -> CollabConfig {
        let mut config = CollabConfig::load_or_default(&self.config);
        if !self.relays.is_empty() {
            config.doc_relays = self.relays.clone();
        }
        config
    }

    fn identity(&self) -> Result<(Keys, ParticipantMode)> {
        if let Some(passphrase) = &self.group {
            return Ok((Keys::from_group_passphrase(passphrase)?, ParticipantMode::Group));
        }
        let keys = match &self.secret {
            Some(secret) => Keys::from_secret_hex(secret).context("invalid --secret")?,
            None => {
                let keys = Keys::generate();
                info!("Using a throwaway identity {}", keys.public_key());
                keys
            }
        };
        Ok((keys, ParticipantMode::Personal))
    }

    /// Opens a session and returns it with its relay pool and public key.
    async fn open(
        &self,
        config: &CollabConfig,
        app: AppKind,
        document: &str,
    ) -> Result<(DocumentSession, Arc<RelayPool>, String)> {
        let (keys, mode) = self.identity()?;
        let public_key = keys.public_key().to_string();
        let pool = Arc::new(RelayPool::new(config.relay.clone()));
        let signer: Arc<dyn Signer> = Arc::new(keys);
        let options = SessionOptions::from_config(app, document, config, pool.clone(), signer)?
            .with_mode(mode);
        let session = DocumentSession::open(options).await?;
        Ok((session, pool, public_key))
    }

    async fn watch(&self, app: AppKind, document: &str, name: &str) -> Result<()> {
        let config = self.config();
        let (mut session, pool, public_key) = self.open(&config, app, document).await?;
        let profile_relays = Arc::new(RelaySet::new(pool.clone(), &config.profile_relays));
        let mut profiles = ProfileNames::new(profile_relays.clone(), PROFILE_TIMEOUT);
        session
            .presence()
            .set_local_state(Some(json!({
                "user": { "name": name, "color": color_for(&public_key) }
            })))
            .await?;

        let (changed_tx, mut changed) = mpsc::unbounded_channel();
        let _updates = session
            .doc()
            .observe_update_v1(move |_, _| {
                let _ = changed_tx.send(());
            })
            .map_err(|e| anyhow!("cannot observe document: {e:?}"))?;
        let mut roster = session.presence().subscribe_changes();

        println!("{}", render::document(app, session.doc()));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                Some(()) = changed.recv() => {
                    while changed.try_recv().is_ok() {}
                    println!("{}", render::document(app, session.doc()));
                }
                change = roster.recv() => match change {
                    Ok(_) => {
                        let entries = session.presence().roster();
                        profiles.resolve(&entries).await;
                        println!("{}", render::roster(&entries, &profiles));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {n} roster changes"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Leaving {}", session.document_id());
        session.close();
        profile_relays.close();
        // Let the departure announcement go out before the sockets close.
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.close_all();
        Ok(())
    }

    async fn snapshot(
        &self,
        app: AppKind,
        document: &str,
        kind: SnapshotKind,
        wait: Duration,
    ) -> Result<()> {
        let config = self.config();
        let (mut session, pool, _) = self.open(&config, app, document).await?;
        let channel = session.document();
        match tokio::time::timeout(wait, channel.wait_until_live()).await {
            Ok(live) => live?,
            Err(_) => warn!("No end of stored events after {wait:?}; saving what arrived"),
        }
        let event = channel.save_snapshot(kind).await?;
        println!("{} {}", event.id, event.created_at);

        session.close();
        pool.close_all();
        Ok(())
    }
}
