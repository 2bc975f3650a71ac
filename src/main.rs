use anyhow::{Context, Result};
use tracing::{error, info};

use sqlstore::config::{Config, DriverKind};
use sqlstore::{Driver, PostgresDriver, Session, SqliteDriver};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    info!("sqlstore v{}", env!("CARGO_PKG_VERSION"));

    match config.driver {
        DriverKind::Postgres => run(PostgresDriver::from_config(&config), &config).await,
        DriverKind::Sqlite => run(SqliteDriver::new(), &config).await,
    }
}

async fn run<D: Driver>(driver: D, config: &Config) -> Result<()> {
    let session = Session::new(driver, config.credentials());
    session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {:?}", config.dbname))?;

    let outcome = run_statements(&session, config).await;

    if let Err(e) = session.disconnect().await {
        error!("Disconnect failed: {}", e);
    }
    outcome
}

async fn run_statements<D: Driver>(session: &Session<D>, config: &Config) -> Result<()> {
    for statement in &config.execute {
        let affected = session
            .exec(statement, &[])
            .await
            .with_context(|| format!("Failed to execute {statement:?}"))?;
        info!("{} row(s) affected", affected);
    }

    for query in &config.query {
        let mut cursor = session
            .query(query, &[])
            .await
            .with_context(|| format!("Failed to run {query:?}"))?;

        println!("{}", cursor.columns().join("\t"));
        let mut count = 0usize;
        while let Some(row) = cursor.next().await {
            let row = row?;
            let fields: Vec<String> = row.values().iter().map(|v| v.to_string()).collect();
            println!("{}", fields.join("\t"));
            count += 1;
        }
        info!("{} row(s) returned", count);
    }
    Ok(())
}
