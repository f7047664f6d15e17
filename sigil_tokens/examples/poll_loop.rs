use std::{path::PathBuf, time::Duration};

use clap::Parser;
use sigil_clock::{Clock, System};
use sigil_tokens::{
    config::SignerConfig,
    credentials::CredentialSource,
    exchange::{ExchangeConfig, HttpTokenExchange},
    storage::{FileStorage, StorageKind},
    transport::{TlsTransport, TrustConfig},
    TokenManager, TokenState, TokenStatus,
};

#[derive(Debug, Parser)]
struct Opts {
    /// A JSON file holding a complete signer configuration
    ///
    /// When given, the remaining credential options are ignored.
    #[arg(short, long, env)]
    config: Option<PathBuf>,

    /// The directory standing in for the device's flash filesystem
    #[arg(long, env, default_value = ".")]
    flash_root: PathBuf,

    /// The directory standing in for the device's SD card
    #[arg(long, env)]
    sd_root: Option<PathBuf>,

    /// The service-account document, relative to its storage root
    #[arg(short = 'f', long, env, default_value = "service_account.json")]
    credentials_file: String,

    /// Read the service-account document from the SD card instead of flash
    #[arg(long, env)]
    from_sd: bool,

    /// Scopes to request, separated by spaces or commas
    #[arg(short, long, env)]
    scopes: Option<String>,

    /// A PEM file of CA certificates to trust instead of the bundled roots
    #[arg(long, env)]
    ca_cert: Option<String>,

    /// How often to poll the token manager, in milliseconds
    #[arg(long, env, default_value_t = 1000)]
    poll_ms: u64,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => {
            let storage = if opts.from_sd {
                StorageKind::Sd
            } else {
                StorageKind::Flash
            };
            let mut config = SignerConfig::new(CredentialSource::file(
                opts.credentials_file.clone(),
                storage,
            ));
            if let Some(scopes) = &opts.scopes {
                config = config.with_scopes(scopes);
            }
            if let Some(path) = &opts.ca_cert {
                config = config.with_trust(TrustConfig::CaCertFile {
                    path: path.clone(),
                    storage: StorageKind::Flash,
                });
            }
            config
        }
    };

    let mut storage = FileStorage::new().with_flash_root(&opts.flash_root);
    if let Some(sd_root) = &opts.sd_root {
        storage = storage.with_sd_root(sd_root);
    }

    let exchange = HttpTokenExchange::with_config(TlsTransport::new(), ExchangeConfig::default());

    let mut manager = TokenManager::new(exchange, storage, System);
    manager.on_status(|info| {
        tracing::info!(
            kind = %info.kind,
            state = %info.state,
            error = %info.error_string(),
            "token status changed"
        );
    });
    manager.begin(config);

    let poll = Duration::from_millis(opts.poll_ms);
    loop {
        let state = manager.tick();

        if let Some(token) = manager.token() {
            let status = token.token_status_at(System.now());
            match status {
                TokenStatus::Fresh => {
                    tracing::debug!(
                        ?status,
                        token = format_args!("{:#?}", token.access_token()),
                        stale = token.stale().0,
                        expiry = token.expiry().0,
                        "pulled token"
                    )
                }
                TokenStatus::Stale => {
                    tracing::warn!(
                        ?status,
                        stale = token.stale().0,
                        expiry = token.expiry().0,
                        "pulled token"
                    )
                }
                TokenStatus::Expired => {
                    tracing::error!(
                        ?status,
                        stale = token.stale().0,
                        expiry = token.expiry().0,
                        "pulled token"
                    )
                }
            }
        }

        if state == TokenState::Error && manager.last_error().map_or(false, |e| e.is_fatal()) {
            tracing::error!(error = %manager.token_error(), "token manager halted");
            break;
        }

        std::thread::sleep(poll);
    }

    Ok(())
}
