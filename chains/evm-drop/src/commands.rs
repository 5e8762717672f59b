use crate::cli::{
    AllowListArgs, AllowListCommand, CommitmentCommand, MintArgs, PhaseCommand, PhaseSetArgs,
};
use crate::client::EthersChainClient;
use crate::config::DropCliConfig;
use crate::supply::TotalSupplyRefresh;
use anyhow::{bail, Context, Result};
use drop_core::merkle;
use drop_core::{
    address, normalize, normalize_all, parse_address_list, ConsistencyGuard, FeePolicy,
    MintMetrics, MintQueue, MintSession, PhaseStatus, PhaseStore, PhaseUpdate,
    SqliteRecordSink, SqliteStore, SubmissionEngine, SubmissionEvent, SystemClock,
};
use ethers::signers::Signer;
use ethers::types::H256;
use ethers::utils::format_ether;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Parse a 32-byte hex value such as a root or proof node.
pub fn parse_hash(raw: &str) -> Result<H256> {
    let digits = raw.trim().trim_start_matches("0x");
    let bytes = hex::decode(digits).with_context(|| format!("'{}' is not hex", raw))?;
    if bytes.len() != 32 {
        bail!("'{}' is {} bytes, expected 32", raw, bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

async fn read_addresses(file: Option<&PathBuf>, inline: &[String]) -> Result<Vec<String>> {
    let mut raw = inline.to_vec();
    if let Some(path) = file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        raw.extend(parse_address_list(&text));
    }
    if raw.is_empty() {
        bail!("No addresses given");
    }
    Ok(raw)
}

/// Commitment commands work on files only; no config or database needed.
pub async fn run_commitment(command: CommitmentCommand) -> Result<()> {
    match command {
        CommitmentCommand::Build { file, out } => {
            let raw = read_addresses(Some(&file), &[]).await?;
            let normalized = normalize_all(&raw);
            for bad in &normalized.invalid {
                warn!("Skipping malformed address: {}", bad);
            }

            let commitment = merkle::build(&normalized.valid);
            println!("root:    {:?}", commitment.root);
            println!("members: {}", commitment.len());
            println!("skipped: {}", normalized.invalid.len());

            if let Some(out) = out {
                let json = serde_json::to_string_pretty(&commitment)?;
                tokio::fs::write(&out, json)
                    .await
                    .with_context(|| format!("Failed to write {}", out.display()))?;
                info!("Commitment written to {}", out.display());
            }
        }
        CommitmentCommand::Verify {
            root,
            address,
            proof,
        } => {
            let root = parse_hash(&root)?;
            let address = normalize(&address)?;
            let proof = proof
                .iter()
                .map(|node| parse_hash(node))
                .collect::<Result<Vec<_>>>()?;

            if !merkle::verify(&address, root, &proof) {
                bail!(
                    "Proof for {} does not verify against {:?}",
                    address::display(&address),
                    root
                );
            }
            println!("VALID: {} is a member of {:?}", address::display(&address), root);
        }
    }
    Ok(())
}

/// Storage-backed handle for phase, allow-list and mint commands.
pub struct DropApp {
    config: DropCliConfig,
    sqlite: Arc<SqliteStore>,
    store: Arc<PhaseStore>,
}

impl DropApp {
    pub async fn open(config: DropCliConfig) -> Result<Self> {
        let sqlite = Arc::new(SqliteStore::new(&config.database).await?);
        let store = PhaseStore::open(
            &config.collection,
            sqlite.clone(),
            Arc::new(ConsistencyGuard::new()),
            Arc::new(SystemClock),
            config.drop.phases.clone(),
        )
        .await?;

        Ok(Self {
            config,
            sqlite,
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> &Arc<PhaseStore> {
        &self.store
    }

    pub async fn close(self) {
        self.sqlite.close().await;
    }

    pub async fn phases(&self, command: PhaseCommand) -> Result<()> {
        match command {
            PhaseCommand::List => self.print_phases().await,
            PhaseCommand::Set(args) => self.set_phase(args).await?,
            PhaseCommand::Remove { phase } => {
                let removal = self.store.remove_phase(phase).await?;
                println!("Removed {}", removal.removed.key);
                for adjustment in &removal.adjustments {
                    println!("  adjusted: {}", adjustment);
                }
            }
            PhaseCommand::Active => {
                let now = self.store.clock().now();
                match self.store.active_phase(now).await {
                    Some(phase) => println!(
                        "{} is active until {} at {} ETH",
                        phase.key,
                        phase.end,
                        format_ether(phase.price)
                    ),
                    None => println!("No phase is active"),
                }
            }
            PhaseCommand::Supply { total } => {
                let adjustments = self.store.set_total_supply(total).await?;
                println!("Total supply set to {}", total);
                for adjustment in &adjustments {
                    println!("  adjusted: {}", adjustment);
                }
            }
        }
        Ok(())
    }

    async fn print_phases(&self) {
        let now = self.store.clock().now();
        println!(
            "{} | total supply {}",
            self.store.collection(),
            self.store.total_supply().await
        );
        for phase in self.store.phases().await {
            let status = PhaseStatus::of(Some(&phase), now);
            let halted = if self
                .store
                .guard()
                .is_halted(self.store.collection(), phase.key)
            {
                " HALTED"
            } else {
                ""
            };
            println!(
                "{:<10} {:<15} {:>10} ETH  alloc {:<6} {} -> {}  {}{}",
                phase.key.as_str(),
                format!("{:?}", status),
                format_ether(phase.price),
                phase.allocation,
                phase.start.format("%Y-%m-%d %H:%M"),
                phase.end.format("%Y-%m-%d %H:%M"),
                if phase.is_public { "public" } else { "gated" },
                halted
            );
        }
    }

    async fn set_phase(&self, args: PhaseSetArgs) -> Result<()> {
        let mut update = PhaseUpdate::new();
        if let Some(price) = &args.price {
            update = update.price_ether(price)?;
        }
        if let Some(allocation) = args.allocation {
            update = update.allocation(allocation);
        }
        if let Some(start) = args.start {
            update = update.start(start);
        }
        if let Some(end) = args.end {
            update = update.end(end);
        }
        if let Some(active) = args.active {
            update = update.active(active);
        }
        if let Some(public) = args.public {
            update = update.public(public);
        }

        let change = self.store.upsert_phase(args.phase, update).await?;
        println!(
            "{} {}: {} -> {}, alloc {}, {} ETH",
            if change.created { "Created" } else { "Updated" },
            change.phase.key,
            change.phase.start,
            change.phase.end,
            change.phase.allocation,
            format_ether(change.phase.price)
        );
        for adjustment in &change.adjustments {
            println!("  adjusted: {}", adjustment);
        }
        Ok(())
    }

    pub async fn allow_list(&self, command: AllowListCommand) -> Result<()> {
        match command {
            AllowListCommand::Set(args) => {
                let raw = self.collect(&args).await?;
                let update = self.store.set_allow_list(args.phase, &raw).await?;
                report_update(&update);
            }
            AllowListCommand::Add(args) => {
                let raw = self.collect(&args).await?;
                let update = self.store.add_addresses(args.phase, &raw).await?;
                report_update(&update);
            }
            AllowListCommand::Remove(args) => {
                let raw = self.collect(&args).await?;
                let update = self.store.remove_addresses(args.phase, &raw).await?;
                report_update(&update);
            }
            AllowListCommand::Show { phase } => {
                let members = self.store.allow_list(phase).await?;
                let commitment = self.store.commitment(phase).await?;
                println!("{} root {:?} ({} members)", phase, commitment.root, members.len());
                for member in &members {
                    println!("  {}", address::display(member));
                }
            }
            AllowListCommand::Proof { phase, address } => {
                let address = normalize(&address)?;
                match self.store.proof_for(phase, &address).await? {
                    Some(proof) => println!("{}", serde_json::to_string_pretty(&proof)?),
                    None => bail!(
                        "{} is not on the {} allow-list",
                        address::display(&address),
                        phase
                    ),
                }
            }
        }
        Ok(())
    }

    async fn collect(&self, args: &AllowListArgs) -> Result<Vec<String>> {
        read_addresses(args.file.as_ref(), &args.addresses).await
    }

    pub async fn mint(&self, args: MintArgs) -> Result<()> {
        let wallet = self.config.wallet()?;
        let minter = wallet.as_ref().map(|w| w.address());
        let actor = minter
            .map(|a| address::display(&a))
            .unwrap_or_else(|| "anonymous".to_string());

        let client = Arc::new(EthersChainClient::new(&self.config, wallet)?);
        client.ensure_chain().await?;

        let contract = self.config.contract_address()?;
        let settings = &self.config.drop;

        let records = Arc::new(SqliteRecordSink::spawn(self.sqlite.pool(), settings.records));
        let refresh = Arc::new(TotalSupplyRefresh::new(client.clone(), contract));
        if let Some(minted) = refresh.refresh().await {
            info!("'{}' has {} minted on chain", self.config.collection, minted);
        }

        let engine = Arc::new(
            SubmissionEngine::new(
                client,
                Arc::new(MintQueue::new()),
                Arc::new(FeePolicy::new(settings.fees.clone())),
                Arc::new(MintMetrics::new()),
                self.store.guard().clone(),
                contract,
                settings.submission.clone(),
                settings.backoff.clone(),
            )
            .with_records(records.clone())
            .with_refresh(refresh)
            .with_actor(&actor),
        );
        let session = Arc::new(MintSession::new(self.store.clone(), engine.clone(), minter));

        let mut events = engine.subscribe();
        let mut pending = HashSet::new();
        for _ in 0..args.count {
            let id = session.enqueue_mint(args.quantity, args.priority).await?;
            pending.insert(id);
        }

        let cancel = CancellationToken::new();

        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while !pending.is_empty() {
                    match events.recv().await {
                        Ok(SubmissionEvent::Confirmed { id, .. })
                        | Ok(SubmissionEvent::Failed { id, .. }) => {
                            pending.remove(&id);
                        }
                        Ok(SubmissionEvent::PhaseHalted { collection, phase }) => {
                            error!("{} of '{}' halted, stopping", phase, collection);
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event stream lagged by {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                cancel.cancel();
            })
        };

        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing the request in flight");
                    cancel.cancel();
                }
            })
        };

        let metrics_task = args.export_metrics.clone().map(|path| {
            let session = session.clone();
            let interval_secs = args.metrics_interval.max(1);
            tokio::spawn(async move {
                let mut interval = interval(Duration::from_secs(interval_secs));
                loop {
                    interval.tick().await;
                    if let Err(e) = session.metrics().export_to_file(&path).await {
                        error!("Metrics export failed: {}", e);
                    }
                }
            })
        });

        let snapshot = session.run(cancel).await;

        let mut tasks = vec![watcher, interrupt];
        tasks.extend(metrics_task);
        stop_tasks(tasks).await;

        if let Some(path) = &args.export_metrics {
            snapshot
                .export_to_file(path)
                .await
                .with_context(|| format!("Failed to export metrics to {}", path))?;
            info!("Metrics exported to {}", path);
        }
        println!("{}", snapshot.to_json());

        drop(session);
        drop(engine);
        release_records(records).await
    }
}

/// Abort helper tasks and wait until each has actually let go of what it
/// captured.
async fn stop_tasks(tasks: Vec<JoinHandle<()>>) {
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("Helper task ended abnormally: {}", e);
            }
        }
    }
}

/// Flush the action log once nothing else holds the sink.
async fn release_records(records: Arc<SqliteRecordSink>) -> Result<()> {
    match Arc::try_unwrap(records) {
        Ok(records) => records.shutdown().await,
        Err(records) => {
            warn!(
                "Action log still referenced {} times, skipping final flush",
                Arc::strong_count(&records) - 1
            );
            Ok(())
        }
    }
}

fn report_update(update: &drop_core::AllowListUpdate) {
    for bad in &update.invalid {
        warn!("Skipping malformed address: {}", bad);
    }
    println!(
        "{} allow-list: {} members, root {:?}",
        update.key, update.members, update.root
    );
}
