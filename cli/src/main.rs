//! zdoge wallet CLI.
//!
//! Subcommands:
//!   init        - Unlock the wallet, sync pool state, print the identity
//!   address     - Print this wallet's shielded receive address
//!   balance     - Shielded balance per token
//!   notes       - List active notes
//!   shield      - Deposit public tokens into the pool
//!   transfer    - Private transfer to a shielded address
//!   unshield    - Withdraw to a public address via the relayer
//!   swap        - Swap tokens inside the shielded set
//!   consolidate - Drain all notes of a token to the public wallet
//!   backup      - Export identity + notes as JSON
//!   restore     - Import a backup
//!   watch       - Run the discovery loop until interrupted
//!
//! Configuration comes from the environment (or .env):
//!   RPC_URL, POOL_ADDRESS, RELAYER_URL, PROVER_URL, PRIVATE_KEY,
//!   CHAIN_ID, DEPLOY_BLOCK, DATA_DIR, TOKENS ("SYM:0xaddr:decimals,…")

use std::path::PathBuf;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zdoge_lib::{
    format_amount, parse_amount, ChainClient, DiscoveryConfig, EngineConfig, EngineError,
    ErrorKind, HttpProver, LocalWallet, Notifier, RelayerClient, ShieldedAddress, TokenInfo,
    WalletConnector as _, WalletEngine, WalletEvent,
};

#[derive(Parser)]
#[command(name = "zdoge")]
#[command(about = "Shielded pool wallet for the zdoge pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock the wallet, sync the pool state, print the identity
    Init,
    /// Print this wallet's shielded receive address
    Address,
    /// Shielded balance for a token (default: DOGE)
    Balance {
        #[arg(long)]
        token: Option<String>,
    },
    /// List active notes
    Notes,
    /// Deposit public tokens into the pool
    Shield {
        /// Decimal amount, e.g. "10" or "0.5"
        amount: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Private transfer to a zdoge: address
    Transfer {
        recipient: String,
        amount: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Withdraw to a public 0x address via the relayer
    Unshield {
        recipient: String,
        amount: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Swap inside the shielded set
    Swap {
        token_in: String,
        token_out: String,
        amount_in: String,
        min_out: String,
    },
    /// Withdraw every spendable note of a token, one transaction each
    Consolidate {
        #[arg(long)]
        token: Option<String>,
        /// Defaults to the wallet's own address
        #[arg(long)]
        recipient: Option<String>,
    },
    /// Export identity + notes as JSON
    Backup {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a backup produced by `backup`
    Restore { input: PathBuf },
    /// Run the discovery loop until Ctrl-C
    Watch,
}

// ---------------------------------------------------------------------------
// Environment configuration
// ---------------------------------------------------------------------------

struct Env {
    rpc_url: String,
    pool_address: Address,
    relayer_url: String,
    prover_url: String,
    private_key: String,
    chain_id: u64,
    deploy_block: u64,
    data_dir: PathBuf,
    tokens: Vec<TokenInfo>,
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} not set"))
}

fn load_env() -> Result<Env> {
    let tokens = parse_token_registry(&std::env::var("TOKENS").unwrap_or_default())?;
    Ok(Env {
        rpc_url: env_var("RPC_URL")?,
        pool_address: env_var("POOL_ADDRESS")?.parse().context("POOL_ADDRESS")?,
        relayer_url: env_var("RELAYER_URL")?,
        prover_url: env_var("PROVER_URL")?,
        private_key: env_var("PRIVATE_KEY")?,
        chain_id: env_var("CHAIN_ID")?.parse().context("CHAIN_ID")?,
        deploy_block: std::env::var("DEPLOY_BLOCK")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .context("DEPLOY_BLOCK must be a number")?,
        data_dir: std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".zdoge")),
        tokens,
    })
}

/// "USDC:0xabc…:6,WETH:0xdef…:18" → registry. The native coin is implicit.
fn parse_token_registry(raw: &str) -> Result<Vec<TokenInfo>> {
    let mut tokens = vec![TokenInfo::native()];
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let mut parts = entry.trim().split(':');
        let (symbol, address, decimals) = (parts.next(), parts.next(), parts.next());
        match (symbol, address, decimals) {
            (Some(symbol), Some(address), Some(decimals)) => tokens.push(TokenInfo {
                address: address.parse().with_context(|| format!("token {entry}"))?,
                symbol: symbol.to_string(),
                decimals: decimals.parse().with_context(|| format!("token {entry}"))?,
            }),
            _ => bail!("TOKENS entry must be SYMBOL:ADDRESS:DECIMALS, got {entry:?}"),
        }
    }
    Ok(tokens)
}

fn resolve_token<'a>(env: &'a Env, symbol: Option<&str>) -> Result<&'a TokenInfo> {
    let symbol = symbol.unwrap_or("DOGE");
    env.tokens
        .iter()
        .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
        .with_context(|| format!("unknown token {symbol:?}; add it to TOKENS"))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, event: WalletEvent) {
        match event {
            WalletEvent::StateChanged => {}
            WalletEvent::NotesDiscovered { token, notes } => {
                let total = notes.iter().fold(U256::ZERO, |acc, n| acc + n.amount);
                println!(
                    "received {} {} across {} note(s)",
                    format_amount(total, token.decimals),
                    token.symbol,
                    notes.len()
                );
            }
            WalletEvent::UnshieldSettled {
                recipient,
                amount,
                tx_hash,
                ..
            } => {
                println!("unshield to {recipient} settled ({amount} base units, tx {tx_hash})");
            }
            WalletEvent::Desync { local, chain } => {
                eprintln!("WARNING: local tree desynced (local {local}, chain {chain}); run resync");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(engine_err) => match engine_err.kind() {
            ErrorKind::UserInput | ErrorKind::Balance => 2,
            ErrorKind::Network => 3,
            ErrorKind::Persistence => 4,
            ErrorKind::Invariant => 5,
        },
        None => 2,
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env = load_env()?;

    let wallet = Arc::new(LocalWallet::connect(&env.rpc_url, &env.private_key)?);
    let chain = Arc::new(ChainClient::connect(&env.rpc_url, env.pool_address)?);
    let relayer = Arc::new(RelayerClient::new(&env.relayer_url)?);
    let prover = Arc::new(HttpProver::new(&env.prover_url)?);

    let config = EngineConfig {
        chain_id: env.chain_id,
        pool_address: env.pool_address,
        deploy_block: env.deploy_block,
        confirmations: 1,
        data_dir: env.data_dir.clone(),
        tokens: env.tokens.clone(),
        discovery: DiscoveryConfig::default(),
    };

    let engine = WalletEngine::init(
        wallet.clone(),
        chain,
        relayer,
        prover,
        Arc::new(StdoutNotifier),
        config,
    )
    .await?;

    match cli.command {
        Commands::Init => {
            println!("shielded address: {}", engine.address());
            println!("vault: {}", env.data_dir.display());
            for token in &env.tokens {
                let balance = engine.balance(token);
                println!(
                    "{}: {}",
                    token.symbol,
                    format_amount(balance, token.decimals)
                );
            }
        }
        Commands::Address => {
            println!("{}", engine.address());
        }
        Commands::Balance { token } => {
            let token = resolve_token(&env, token.as_deref())?;
            let balance = engine.balance(token);
            println!("{} {}", format_amount(balance, token.decimals), token.symbol);
        }
        Commands::Notes => {
            let notes = engine.notes();
            if notes.is_empty() {
                println!("no active notes");
            }
            for note in notes {
                let status = match note.leaf_index {
                    Some(leaf) => format!("leaf {leaf}"),
                    None => "pending".to_string(),
                };
                println!(
                    "{} {} ({status})",
                    format_amount(note.amount, note.token_decimals),
                    note.token_symbol,
                );
            }
        }
        Commands::Shield { amount, token } => {
            let token = resolve_token(&env, token.as_deref())?;
            let amount = parse_amount(&amount, token.decimals).map_err(EngineError::from)?;
            let (note, tx_hash) = engine.shield(token, amount).await?;
            println!(
                "shielded {} {}",
                format_amount(note.amount, token.decimals),
                token.symbol
            );
            println!("tx: {tx_hash}");
            println!("note: {}", note.to_shareable_string());
        }
        Commands::Transfer {
            recipient,
            amount,
            token,
        } => {
            let token = resolve_token(&env, token.as_deref())?;
            let recipient: ShieldedAddress = recipient.parse().map_err(EngineError::from)?;
            let amount = parse_amount(&amount, token.decimals).map_err(EngineError::from)?;
            let outcome = engine.transfer(&recipient, token, amount).await?;
            println!(
                "sent {} {} (fee {}, change {})",
                format_amount(amount, token.decimals),
                token.symbol,
                format_amount(outcome.fee, token.decimals),
                format_amount(outcome.change, token.decimals),
            );
            println!("tx: {}", outcome.tx_hash);
        }
        Commands::Unshield {
            recipient,
            amount,
            token,
        } => {
            let token = resolve_token(&env, token.as_deref())?;
            let recipient: Address = recipient.parse().context("invalid recipient address")?;
            let amount = parse_amount(&amount, token.decimals).map_err(EngineError::from)?;
            let outcome = engine.unshield(recipient, token, amount).await?;
            println!(
                "unshielded {} {} to {recipient} (fee {})",
                format_amount(outcome.net_amount, token.decimals),
                token.symbol,
                format_amount(outcome.fee, token.decimals),
            );
            println!("tx: {}", outcome.tx_hash);
        }
        Commands::Swap {
            token_in,
            token_out,
            amount_in,
            min_out,
        } => {
            let token_in = resolve_token(&env, Some(&token_in))?;
            let token_out = resolve_token(&env, Some(&token_out))?;
            let amount_in =
                parse_amount(&amount_in, token_in.decimals).map_err(EngineError::from)?;
            let min_out = parse_amount(&min_out, token_out.decimals).map_err(EngineError::from)?;
            let outcome = engine.swap(token_in, token_out, amount_in, min_out).await?;
            println!(
                "swapped {} {} for at least {} {}",
                format_amount(amount_in, token_in.decimals),
                token_in.symbol,
                format_amount(outcome.min_out, token_out.decimals),
                token_out.symbol,
            );
            println!("tx: {}", outcome.tx_hash);
        }
        Commands::Consolidate { token, recipient } => {
            let token = resolve_token(&env, token.as_deref())?;
            let recipient: Address = match recipient {
                Some(raw) => raw.parse().context("invalid recipient address")?,
                None => wallet.address(),
            };
            let tx_hashes = engine.consolidate(token, recipient).await?;
            println!(
                "consolidated {} note(s) of {} to {recipient}",
                tx_hashes.len(),
                token.symbol
            );
            for tx in tx_hashes {
                println!("tx: {tx}");
            }
        }
        Commands::Backup { output } => {
            let backup = engine.backup()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, backup)?;
                    println!("backup written to {}", path.display());
                }
                None => println!("{backup}"),
            }
        }
        Commands::Restore { input } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            engine.restore(&raw)?;
            println!("restored {} note(s)", engine.notes().len());
        }
        Commands::Watch => {
            let handle = engine.start_discovery();
            println!("watching the pool; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            handle.stop_and_join().await;
            println!("stopped");
        }
    }

    Ok(())
}
