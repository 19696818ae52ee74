use std::sync::Arc;

use clap::{Parser, Subcommand};
use ed25519_dalek::{Keypair, Signer};
use engine::files::build_trilogy;
use engine::{Cas, Operation, OperationProcessor, Resolver};
use node::{InMemoryBlockchain, InMemoryCas, NodeConfig, Observer};
use rand::rngs::OsRng;
use tokio::sync::Mutex;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "sidetree-observer")]
#[command(about = "Fork-tolerant DID layer-2 observer/resolver node")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Anchor a handful of operations on an in-memory blockchain, run the
    /// observer against it, and resolve the resulting DID.
    Demo,
}

fn init_logging(log_level: &str) {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

fn sign(keypair: &Keypair, mut op: Operation) -> Operation {
    let payload = {
        let mut value = serde_json::to_value(&op).expect("operations always serialize");
        value
            .as_object_mut()
            .expect("operations serialize to a JSON object")
            .remove("signature");
        common::canonical::canonicalize(&value).expect("canonicalization never fails on operation JSON")
    };
    let signature = hex::encode(keypair.sign(&payload).to_bytes());
    match &mut op {
        Operation::Create { signature: s, .. }
        | Operation::Update { signature: s, .. }
        | Operation::Recover { signature: s, .. }
        | Operation::Deactivate { signature: s, .. } => *s = signature,
    }
    op
}

fn delta(update_kp: &Keypair, recovery_kp: &Keypair, document: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "patches": [{"action": "replace", "document": document}],
        "updateKey": hex::encode(update_kp.public.to_bytes()),
        "recoveryKey": hex::encode(recovery_kp.public.to_bytes()),
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => run_demo().await,
    }
}

/// Anchors a Create followed by an Update operation through the batch writer
/// and in-memory CAS/blockchain, runs the observer to absorb them into the
/// operation DAG, then resolves and prints the resulting DID document.
async fn run_demo() {
    let blockchain = Arc::new(InMemoryBlockchain::new());
    let cas = Arc::new(InMemoryCas::new());
    let processor = Arc::new(Mutex::new(OperationProcessor::new()));

    let genesis_kp = keypair();
    let update_kp = keypair();
    let next_update_kp = keypair();

    let create_delta = delta(&update_kp, &genesis_kp, serde_json::json!({"greeting": "hello"}));
    let did_suffix = engine::operation::compute_create_identity(
        &create_delta,
        engine::operation::default_encoding(),
    )
    .expect("create identity computation never fails on well-formed JSON");

    let create_unsigned = Operation::Create {
        did_suffix: did_suffix.clone(),
        operation_hash: did_suffix.clone(),
        signature: String::new(),
        delta: create_delta,
    };
    let create_op = sign(&genesis_kp, create_unsigned);

    info!(%did_suffix, "anchoring create operation");
    anchor_batch(&cas, &blockchain, vec![create_op]).await;

    let update_delta = delta(&next_update_kp, &genesis_kp, serde_json::json!({"greeting": "hello, again"}));
    let update_unsigned = Operation::Update {
        did_suffix: did_suffix.clone(),
        operation_hash: format!("{did_suffix}-update-1"),
        previous_operation_hash: did_suffix.clone(),
        reveal_value: "reveal-1".to_string(),
        signature: String::new(),
        delta: update_delta,
    };
    let update_op = sign(&update_kp, update_unsigned);

    info!("anchoring update operation");
    anchor_batch(&cas, &blockchain, vec![update_op]).await;

    let observer = Observer::new(
        blockchain.clone(),
        cas.clone(),
        Arc::new(engine::InMemoryTransactionStore::new()),
        processor.clone(),
        NodeConfig::default(),
    );
    observer.run_once().await.expect("demo observer run should not fail");
    // give the spawned download/process tasks a moment to settle before
    // resolving; a long-running node would instead simply call run() in a
    // loop and resolve on demand.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    observer.run_once().await.expect("demo observer run should not fail");

    let state = {
        let processor = processor.lock().await;
        Resolver::resolve(&processor, &did_suffix)
    };

    match state {
        Ok(state) => {
            println!("Resolved DID: {}", state.did);
            println!("Document: {}", state.document);
            println!("Deactivated: {}", state.deactivated);
        }
        Err(e) => {
            println!("Could not resolve DID {did_suffix}: {e}");
        }
    }
}

async fn anchor_batch(cas: &InMemoryCas, blockchain: &InMemoryBlockchain, ops: Vec<Operation>) {
    let (mut anchor, mut map, chunk) = build_trilogy(&ops, None).expect("demo operations always split cleanly");

    let chunk_hash = cas
        .write(&serde_json::to_vec(&chunk).expect("chunk files always serialize"))
        .await
        .expect("in-memory CAS writes never fail");
    map.chunk_file_uri = chunk_hash;

    let map_hash = cas
        .write(&serde_json::to_vec(&map).expect("map files always serialize"))
        .await
        .expect("in-memory CAS writes never fail");
    anchor.map_file_uri = map_hash;

    let anchor_bytes = serde_json::to_vec(&anchor).expect("anchor files always serialize");
    let anchor_hash = cas.write(&anchor_bytes).await.expect("in-memory CAS writes never fail");

    let anchor_string = serde_json::json!({
        "anchorFileHash": anchor_hash,
        "numberOfOperations": ops.len(),
    })
    .to_string();

    blockchain.push_transaction(anchor_string, 10);
}
