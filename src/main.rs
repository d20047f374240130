//! Walk-through of the transaction engine
//!
//! Usage: `pessimist [--config config.toml]`

use clap::Parser;
use pessimist::{Assignment, Config, Engine, Error, Filter, Result, Statement, TxnMode, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pessimist")]
#[command(about = "Walk-through of pessimistic locking, lock waits and deadlock detection")]
#[command(version)]
struct Args {
    /// TOML file with engine settings; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(path: &Path) -> Result<Config> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("reading {}: {e}", path.display())))?;
    Config::from_toml_str(&source)
        .map_err(|e| Error::Internal(format!("parsing {}: {e}", path.display())))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    println!("=== Pessimist: transaction engine demo ===\n");
    let engine = Engine::new(config);

    demo_locking_read(&engine).await?;
    demo_lock_wait(&engine).await?;
    demo_deadlock(&engine).await?;

    let metrics = engine.metrics().snapshot();
    println!("\n--- Metrics ---");
    println!(
        "{}",
        metrics
            .to_json()
            .map_err(|e| Error::Internal(e.to_string()))?
    );

    println!("\n=== All demos completed successfully! ===");
    Ok(())
}

fn row(k: i64, v: i64) -> Vec<Value> {
    vec![Value::Integer(k), Value::Integer(v)]
}

async fn demo_locking_read(engine: &Engine) -> Result<()> {
    println!("--- Demo 1: locking reads see the latest commit ---");

    let mut setup = engine.session();
    setup
        .execute(Statement::create_table("accounts", &["id", "balance"], Some("id")))
        .await?;
    setup
        .execute(Statement::insert("accounts", vec![row(1, 100), row(2, 100)]))
        .await?;

    let mut t1 = engine.session();
    t1.begin_transaction(Some(TxnMode::Pessimistic)).await?;
    setup
        .execute(Statement::update(
            "accounts",
            Filter::eq("id", 1),
            vec![Assignment::add("balance", 50)],
        ))
        .await?;

    let snapshot = t1
        .execute(Statement::select("accounts", Filter::eq("id", 1)))
        .await?;
    let locked = t1
        .execute(Statement::select_for_update("accounts", Filter::eq("id", 1)))
        .await?;
    println!("  ✓ Snapshot read: {:?}", snapshot.rows());
    println!("  ✓ Locking read:  {:?}", locked.rows());
    t1.commit().await?;
    Ok(())
}

async fn demo_lock_wait(engine: &Engine) -> Result<()> {
    println!("--- Demo 2: a writer waits for the lock holder ---");

    let mut t1 = engine.session();
    let mut t2 = engine.session();
    t1.begin_transaction(Some(TxnMode::Pessimistic)).await?;
    t1.execute(Statement::select_for_update("accounts", Filter::eq("id", 2)))
        .await?;

    let waiter = tokio::spawn(async move {
        let result = t2
            .execute(Statement::update(
                "accounts",
                Filter::eq("id", 2),
                vec![Assignment::add("balance", 1)],
            ))
            .await;
        (t2, result)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    t1.execute(Statement::update(
        "accounts",
        Filter::eq("id", 2),
        vec![Assignment::set("balance", 10)],
    ))
    .await?;
    t1.commit().await?;

    let (mut t2, result) = waiter
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    result?;
    let rows = t2
        .execute(Statement::select("accounts", Filter::eq("id", 2)))
        .await?;
    println!("  ✓ Waiter applied on top of the holder: {:?}", rows.rows());
    Ok(())
}

async fn demo_deadlock(engine: &Engine) -> Result<()> {
    println!("--- Demo 3: deadlock detection ---");

    let mut t1 = engine.session();
    let mut t2 = engine.session();
    t1.begin_transaction(Some(TxnMode::Pessimistic)).await?;
    t2.begin_transaction(Some(TxnMode::Pessimistic)).await?;
    t1.execute(Statement::select_for_update("accounts", Filter::eq("id", 1)))
        .await?;
    t2.execute(Statement::select_for_update("accounts", Filter::eq("id", 2)))
        .await?;

    let waiter = tokio::spawn(async move {
        let result = t1
            .execute(Statement::select_for_update("accounts", Filter::eq("id", 2)))
            .await;
        (t1, result)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    match t2
        .execute(Statement::select_for_update("accounts", Filter::eq("id", 1)))
        .await
    {
        Err(err) => println!("  ✓ Victim aborted with {}: {err}", err.code()),
        Ok(_) => println!("  ✗ Expected a deadlock"),
    }

    let (mut t1, result) = waiter
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    result?;
    t1.commit().await?;
    println!("  ✓ Survivor committed");
    Ok(())
}
