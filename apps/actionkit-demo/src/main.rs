use std::fmt::Display;
use std::sync::Arc;

use actionkit_container::{ActionDefinition, CallContext};
use actionkit_kernel::{ActionKernel, KernelBuilder};
use actionkit_listeners::QueryExecuted;
use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const ACTIONS: [&str; 5] = ["Checkout", "ChargeCard", "SendReceipt", "Fulfil", "AuditTrail"];

#[derive(Debug, Parser)]
#[command(name = "actionkit-demo")]
#[command(about = "Run a checkout action graph under the actionkit harness")]
struct Cli {
    /// Levels of nested fulfilment below the checkout.
    #[arg(long, default_value_t = 2)]
    depth: u64,
    /// Only these actions run below the checkout; every other one is stubbed.
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Stub these actions.
    #[arg(long, value_delimiter = ',')]
    without: Vec<String>,
    /// Print the captured results as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let kernel = KernelBuilder::new().build();
    register_checkout(&kernel)?;

    // JSON logs go to stderr so stdout carries only the report.
    let json_logs = cli.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter())
    });
    let text_logs =
        (!cli.json).then(|| tracing_subscriber::fmt::layer().compact().with_filter(env_filter()));
    tracing_subscriber::registry()
        .with(json_logs)
        .with(text_logs)
        .with(kernel.log_layer())
        .init();

    let mut harness = kernel.testable_for("Checkout")?;
    if !cli.only.is_empty() {
        harness.only(cli.only.iter().map(String::as_str))?;
    }
    if !cli.without.is_empty() {
        harness.without(cli.without.iter().map(String::as_str))?;
    }

    let text = !cli.json;
    harness
        .measure_actions(["ChargeCard", "Fulfil"], move |measurements| {
            if text {
                print_section("timings", measurements);
            }
        })?
        .profile(move |profiles| {
            if text {
                print_section("profile", profiles);
            }
        })
        .queries(move |queries| {
            if text {
                print_section("queries", queries);
            }
        })
        .logs(move |logs| {
            if text {
                print_section("logs", logs);
            }
        });

    let result = harness.handle(json!({ "order": 1042, "depth": cli.depth }))?;
    info!(harness = %harness.id(), "checkout finished");

    if cli.json {
        let report = json!({
            "result": result,
            "measurements": harness.measurements(),
            "profiles": harness.profiles(),
            "queries": harness.queries_recorded(),
            "logs": harness.logs_recorded(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("result: {result}");
    for action in ACTIONS {
        if let Some(stub) = harness.stub(action) {
            println!("stubbed {action}: {} call(s)", stub.calls("handle"));
        }
    }
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn print_section<T: Display>(title: &str, items: &[T]) {
    println!("{title}:");
    for item in items {
        println!("  {item}");
    }
}

fn register_checkout(kernel: &ActionKernel) -> Result<()> {
    kernel.register(
        ActionDefinition::from_fn("Checkout", |cx: &CallContext, args: Value| {
            if let Some(checkout) = cx.current() {
                checkout.on("order.paid", |data| {
                    info!(target: "checkout", amount = %data["amount"], "payment confirmed");
                })?;
            }
            let order = args["order"].clone();
            let charge = cx.call("ChargeCard", json!({ "order": order, "amount": 4999 }))?;
            cx.record_memory("charged")?;
            let receipt = cx.call("SendReceipt", json!({ "order": order }))?;
            let fulfilled = cx.call("Fulfil", json!({ "order": order, "depth": args["depth"] }))?;
            Ok(json!({ "charge": charge, "receipt": receipt, "fulfilled": fulfilled }))
        })
        .emits(["order.paid"])?,
    );

    let payments = Arc::clone(kernel.query_feed());
    kernel.register(
        ActionDefinition::from_fn("ChargeCard", move |cx: &CallContext, args: Value| {
            payments.notify(&QueryExecuted::new(
                "insert into payments (order_id, amount) values (?, ?)",
                vec![args["order"].clone(), args["amount"].clone()],
                3.2,
            ));
            if let Some(charge) = cx.current() {
                charge.forward_events(["order.paid"]);
            }
            cx.emit("order.paid", json!({ "amount": args["amount"] }))?;
            Ok(json!("charged"))
        })
        .emits(["order.paid"])?,
    );

    kernel.register(ActionDefinition::from_fn(
        "SendReceipt",
        |_cx: &CallContext, args: Value| {
            info!(target: "mail", order = %args["order"], "receipt queued");
            Ok(json!("sent"))
        },
    ));

    let stock = Arc::clone(kernel.query_feed());
    kernel.register(ActionDefinition::from_fn(
        "Fulfil",
        move |cx: &CallContext, args: Value| {
            let depth = args["depth"].as_u64().unwrap_or(0);
            stock.notify(
                &QueryExecuted::new(
                    "update stock set reserved = reserved + 1 where order_id = ?",
                    vec![args["order"].clone()],
                    1.1,
                )
                .on_connection("inventory"),
            );
            cx.call("AuditTrail", json!({ "step": depth }))?;
            if depth > 0 {
                cx.call("Fulfil", json!({ "order": args["order"], "depth": depth - 1 }))?;
            }
            Ok(json!(depth))
        },
    ));

    kernel.register(ActionDefinition::from_fn(
        "AuditTrail",
        |_cx: &CallContext, args: Value| {
            if args["step"] == json!(0) {
                warn!(target: "audit", "fulfilment chain bottomed out");
            }
            Ok(Value::Null)
        },
    ));
    Ok(())
}
