//! txsaga - Unit of Work demo runner
//!
//! This is the main entry point for the txsaga command-line interface. It
//! runs canned scenarios against the in-memory store with a monitor
//! attached and prints what the monitor saw.

use std::process::ExitCode;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use txsaga::monitor::{MonitorConfig, TransactionMonitor};
use txsaga::storage::{MemoryStore, RowKey, TableName};
use txsaga::transaction::{
    CustomOperation, InsertOperation, TransactionError, TransactionManager, TransactionOptions,
    UpdateOperation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Commit,
    Rollback,
    Retry,
    Timeout,
}

impl Scenario {
    const ALL: [Scenario; 4] = [
        Scenario::Commit,
        Scenario::Rollback,
        Scenario::Retry,
        Scenario::Timeout,
    ];

    fn name(&self) -> &'static str {
        match self {
            Scenario::Commit => "commit",
            Scenario::Rollback => "rollback",
            Scenario::Retry => "retry",
            Scenario::Timeout => "timeout",
        }
    }

    fn parse(s: &str) -> Option<Vec<Scenario>> {
        if s == "all" {
            return Some(Self::ALL.to_vec());
        }
        Self::ALL.iter().find(|sc| sc.name() == s).map(|sc| vec![*sc])
    }
}

/// Demo data set.
struct Demo {
    store: MemoryStore,
    manager: TransactionManager<MemoryStore>,
    orders: TableName,
    inventory: TableName,
    widget: RowKey,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut scenarios = Scenario::ALL.to_vec();
    let mut options = TransactionOptions::new().retry_delay_ms(50);
    let mut capacity = MonitorConfig::default().capacity;
    let mut export = false;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-s" | "--scenario" => {
                i += 1;
                match args.get(i).and_then(|s| Scenario::parse(s)) {
                    Some(selected) => scenarios = selected,
                    None => {
                        eprintln!("Expected one of commit, rollback, retry, timeout, all");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "--max-retries" => {
                i += 1;
                match parse_number::<u32>(&args, i) {
                    Some(n) => options = options.max_retries(n),
                    None => return usage_error("--max-retries"),
                }
            }
            "--timeout-ms" => {
                i += 1;
                match parse_number::<u64>(&args, i) {
                    Some(n) => options = options.timeout_ms(n),
                    None => return usage_error("--timeout-ms"),
                }
            }
            "--capacity" => {
                i += 1;
                match parse_number::<usize>(&args, i) {
                    Some(n) => capacity = n,
                    None => return usage_error("--capacity"),
                }
            }
            "--export" => {
                export = true;
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("txsaga v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    init_tracing(verbose);

    if let Err(e) = options.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    let monitor = match TransactionMonitor::with_config(MonitorConfig::new().capacity(capacity)) {
        Ok(monitor) => monitor,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let demo = match Demo::new() {
        Ok(demo) => demo,
        Err(e) => {
            eprintln!("Error preparing demo data: {}", e);
            return ExitCode::FAILURE;
        }
    };
    monitor.attach(&demo.manager);

    for scenario in scenarios {
        let result = match scenario {
            Scenario::Commit => demo.place_order(&options).await,
            Scenario::Rollback => demo.declined_order(&options).await,
            Scenario::Retry => demo.flaky_storage(&options).await,
            Scenario::Timeout => demo.slow_order(&options).await,
        };
        match result {
            Ok(summary) => println!("[{}] ok: {}", scenario.name(), summary),
            Err(e) => println!("[{}] failed: {}", scenario.name(), e),
        }
    }
    println!("stock: {}", demo.stock());

    if export {
        match monitor.export_metrics() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        let stats = monitor.statistics();
        println!();
        println!("transactions: {}", stats.total_transactions);
        println!("  successful: {}", stats.successful_transactions);
        println!("  failed:     {}", stats.failed_transactions);
        println!("avg duration: {:.1}ms", stats.average_duration_ms);
        println!("retries:      {} (rate {:.2})", stats.total_retries, stats.retry_rate);
        println!("events:       {}", monitor.event_count());
    }

    ExitCode::SUCCESS
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "txsaga=debug" } else { "txsaga=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `args[i]` as a non-negative number that fits in `T`.
fn parse_number<T: TryFrom<u64>>(args: &[String], i: usize) -> Option<T> {
    args.get(i)
        .and_then(|s| s.parse::<u64>().ok())
        .and_then(|n| T::try_from(n).ok())
}

fn usage_error(flag: &str) -> ExitCode {
    eprintln!("{} expects a non-negative number in range", flag);
    ExitCode::FAILURE
}

fn print_help() {
    println!("txsaga - Unit of Work coordinator demo");
    println!();
    println!("Usage: txsaga [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -s, --scenario NAME    commit, rollback, retry, timeout or all (default: all)");
    println!("  --max-retries N        Retries after the first attempt (default: 3)");
    println!("  --timeout-ms N         Per-attempt timeout (default: 30000)");
    println!("  --capacity N           Monitor event history size (default: 1000)");
    println!("  --export               Print the monitor's JSON export instead of a summary");
    println!("  -v, --verbose          Enable debug logging (RUST_LOG overrides)");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Examples:");
    println!("  txsaga                             Run every scenario");
    println!("  txsaga -s retry --max-retries 1    Retry scenario with a single retry");
    println!("  txsaga --export                    Dump events and metrics as JSON");
}

impl Demo {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let orders = TableName::new("orders")?;
        let inventory = TableName::new("inventory")?;
        store.create_table(&orders)?;
        store.create_table(&inventory)?;

        let widget = RowKey::new("widget")?;
        store.seed_row(&inventory, widget.clone(), json!({"stock": 10}))?;

        Ok(Self {
            manager: TransactionManager::new(store.clone()),
            store,
            orders,
            inventory,
            widget,
        })
    }

    fn stock(&self) -> serde_json::Value {
        self.store
            .get_row(&self.inventory, &self.widget)
            .and_then(|row| row.get("stock").cloned())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Insert an order and reserve stock.
    async fn place_order(&self, options: &TransactionOptions) -> Result<String, TransactionError> {
        let outcome = self
            .manager
            .execute_with_outcome(
                |ctx| {
                    let (orders, inventory, widget) =
                        (self.orders.clone(), self.inventory.clone(), self.widget.clone());
                    async move {
                        let order = ctx
                            .apply(InsertOperation::from_value(orders, json!({"item": "widget", "qty": 2}))?)
                            .await?;
                        ctx.apply(UpdateOperation::from_value(inventory, widget, json!({"stock": 8}))?)
                            .await?;
                        Ok(order.inserted_key().map(|k| k.to_string()).unwrap_or_default())
                    }
                },
                options.clone(),
            )
            .await?;
        Ok(format!(
            "order {} after {} attempt(s)",
            outcome.value, outcome.attempts
        ))
    }

    /// Reserve stock, then fail at the payment step.
    async fn declined_order(&self, options: &TransactionOptions) -> Result<String, TransactionError> {
        self.manager
            .execute_with_options(
                |ctx| {
                    let (orders, inventory, widget) =
                        (self.orders.clone(), self.inventory.clone(), self.widget.clone());
                    async move {
                        ctx.apply(InsertOperation::from_value(orders, json!({"item": "widget", "qty": 5}))?)
                            .await?;
                        ctx.apply(UpdateOperation::from_value(inventory, widget, json!({"stock": 3}))?)
                            .await?;
                        ctx.register_operation(CustomOperation::compensation_only(
                            "release payment hold",
                            |_| async {
                                tracing::info!("payment hold released");
                                Ok(())
                            },
                        ))?;
                        Err::<String, _>(TransactionError::work("payment declined"))
                    }
                },
                options.clone(),
            )
            .await
    }

    /// Storage refuses the first two boundaries.
    async fn flaky_storage(&self, options: &TransactionOptions) -> Result<String, TransactionError> {
        self.store.fail_next_begins(2);
        let outcome = self
            .manager
            .execute_with_outcome(|_ctx| async { Ok(()) }, options.clone())
            .await;
        // leftover injected failures would leak into later scenarios
        self.store.fail_next_begins(0);
        let outcome = outcome?;
        Ok(format!("committed after {} attempt(s)", outcome.attempts))
    }

    /// Work that outlives its timeout.
    async fn slow_order(&self, options: &TransactionOptions) -> Result<String, TransactionError> {
        let options = options.clone().timeout_ms(options.timeout_ms.min(100)).max_retries(0);
        let stall = Duration::from_millis(options.timeout_ms * 2);
        self.manager
            .execute_with_options(
                move |ctx| {
                    let orders = self.orders.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(orders, json!({"item": "widget", "qty": 1}))?)
                            .await?;
                        tokio::time::sleep(stall).await;
                        Ok("never reached".to_string())
                    }
                },
                options,
            )
            .await
    }
}
