//! Runs one cluster node with an interactive console.
//!
//! ```bash
//! # The introducer
//! ringfs --socket 0.0.0.0:7000 --hostname vm-01
//!
//! # Every other node
//! ringfs --socket 0.0.0.0:7000 --hostname vm-02 --introducer vm-01:7000
//! ```
//!
//! Type `help` at the prompt for the list of commands.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use parking_lot::Mutex;
use ringfs::core::{NetTransport, NodeConfig, Role, Socket};
use ringfs::store::Prompter;
use ringfs::testkit::{init_logging, LogLevel};
use ringfs::Node;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

/// A node of the replicated file store.
#[derive(Parser, Debug)]
#[command(name = "ringfs", version, about, long_about = None)]
struct Args {
  /// Base address. The bulk and transfer listeners use the next three ports.
  #[arg(long, default_value = "0.0.0.0:7000")]
  socket: Socket,

  /// Name shown to other nodes in the membership list.
  #[arg(long, default_value = "localhost")]
  hostname: String,

  /// Address of the introducer. Without it, this node is the introducer.
  #[arg(long)]
  introducer: Option<Socket>,

  /// Directory holding the scratch and store directories and the membership snapshot.
  #[arg(long, default_value = ".")]
  root: PathBuf,

  /// JSON file with a full node configuration. Overrides every other flag.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Log level when RUST_LOG is not set: trace, debug, info, warn, error or off.
  #[arg(long, default_value = "info")]
  log: String,
}

fn log_level(s: &str) -> anyhow::Result<LogLevel> {
  Ok(match s {
    "trace" => LogLevel::Trace,
    "debug" => LogLevel::Debug,
    "info" => LogLevel::Info,
    "warn" => LogLevel::Warn,
    "error" => LogLevel::Error,
    "off" => LogLevel::Off,
    other => bail!("unknown log level {:?}", other),
  })
}

fn node_config(args: &Args) -> anyhow::Result<NodeConfig> {
  if let Some(path) = &args.config {
    let text =
      std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    return serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()));
  }
  let role = match &args.introducer {
    Some(introducer) => Role::Member {
      introducer: introducer.clone(),
    },
    None => Role::Introducer,
  };
  let mut config = NodeConfig::rooted(args.socket.clone(), role, &args.root);
  config.hostname = args.hostname.clone();
  Ok(config)
}

/// Asks overwrite questions on the console. The answer is the next `y` or `n` typed.
#[derive(Default)]
struct ConsolePrompter {
  waiting: Mutex<Option<oneshot::Sender<bool>>>,
}
impl ConsolePrompter {
  /// Passes an answer to the open question. Returns `false` if nothing was asked.
  fn answer(&self, yes: bool) -> bool {
    match self.waiting.lock().take() {
      Some(tx) => tx.send(yes).is_ok(),
      None => false,
    }
  }
}

#[async_trait]
impl Prompter for ConsolePrompter {
  async fn confirm(&self, name: &str) -> bool {
    let (tx, rx) = oneshot::channel();
    *self.waiting.lock() = Some(tx);
    println!("{} was written less than a minute ago. Overwrite? (y/n)", name);
    rx.await.unwrap_or(false)
  }
}

const HELP: &str = "\
membership               list every member
selfid                   this node's id
master                   the coordinator's id
ring                     heartbeat targets and monitored nodes
put <local> <name>       store a scratch file
putdir <localdir> <pre>  store every file of a scratch directory under a prefix
get <name> <local>       fetch an object into the scratch directory
delete <name>            delete an object
deletedir <prefix>       delete every object with a prefix
ls <name>                nodes holding an object
store                    objects held by this node
y | n                    answer an overwrite question
leave                    leave the cluster and exit";

async fn run_command(node: &Node, words: &[&str]) {
  match words {
    ["membership"] => {
      for member in node.members() {
        println!("{}", member);
      }
    }
    ["selfid"] => println!("{}", node.id()),
    ["master"] => match node.coordinator_id() {
      Some(id) => println!("{}", id),
      None => println!("no coordinator"),
    },
    ["ring"] => {
      println!("targets: {:?}", node.heartbeat_targets());
      println!("monitored: {:?}", node.monitored());
    }
    ["put", local, name] => match node.put(local, name, false).await {
      Ok(outcome) => println!("{:?}", outcome),
      Err(e) => println!("put failed: {}", e),
    },
    ["putdir", dir, prefix] => match node.put_dir(dir, prefix).await {
      Ok(outcomes) => {
        for (name, outcome) in outcomes {
          println!("{}: {:?}", name, outcome);
        }
      }
      Err(e) => println!("putdir failed: {}", e),
    },
    ["get", name, local] => match node.get(name, local).await {
      Ok(path) => println!("saved to {}", path.display()),
      Err(e) => println!("get failed: {}", e),
    },
    ["delete", name] => match node.delete(name).await {
      Ok(outcome) => println!("{:?}", outcome),
      Err(e) => println!("delete failed: {}", e),
    },
    ["deletedir", prefix] => match node.delete_prefix(prefix).await {
      Ok(names) => println!("deleted {:?}", names),
      Err(e) => println!("deletedir failed: {}", e),
    },
    ["ls", name] => match node.replica_holders(name) {
      Some(holders) => println!("{:?}", holders),
      None => println!("{} does not exist", name),
    },
    ["store"] => match node.local_objects().await {
      Ok(names) => println!("{:?}", names),
      Err(e) => println!("cannot list the store: {}", e),
    },
    ["help"] => println!("{}", HELP),
    [] => {}
    _ => println!("unknown command, try help"),
  }
}

async fn run(args: Args) -> anyhow::Result<()> {
  let config = node_config(&args)?;
  let prompter = Arc::new(ConsolePrompter::default());
  let node = Node::start_with(config, Arc::new(NetTransport), prompter.clone())
    .await
    .context("could not start the node")?;
  println!("node {} is up, coordinator {:?}", node.id(), node.coordinator_id());

  // Commands run in their own tasks so an overwrite question can be answered while the put
  // that asked it is still waiting.
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    match line.trim() {
      answer @ ("y" | "n") => {
        if !prompter.answer(answer == "y") {
          println!("nothing to answer");
        }
      }
      "leave" => {
        node.leave().await;
        return Ok(());
      }
      _ => {
        let node = node.clone();
        tokio::spawn(async move {
          let words: Vec<&str> = line.split_whitespace().collect();
          run_command(&node, &words).await;
        });
      }
    }
  }
  node.shutdown();
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  init_logging(log_level(&args.log)?);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_cpus::get())
    .enable_all()
    .build()?;
  rt.block_on(run(args))
}
