//! Packboard demo binary
//!
//! Loads configuration, runs one refresh and one pack against the configured
//! backend (or a seeded in-memory one when no URL is set), then prints the
//! board and the collected metrics.

use packboard::backend::InventoryBackend;
use packboard::mocks::MockBackend;
use packboard::{
    BoardAction, BoardConfig, BoardEnvironment, BoardReducer, BoardState, BoardStore, Column,
    HttpBackend, IdempotencyKeyStore, InMemoryKeyValueStore, InventoryUnit, ReqwestTransport,
    RowIndexRef, UnitStatus, UpdateClient, card_id, normalize,
};
use packboard_core::environment::SystemClock;
use packboard_runtime::metrics::MetricsServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn seeded_backend() -> MockBackend {
    MockBackend::new(vec![
        InventoryUnit::new(RowIndexRef(1645), 200, UnitStatus::Manufactured, None, 200),
        InventoryUnit::new(
            RowIndexRef(1646),
            443,
            UnitStatus::Stocked,
            Some(normalize("パレット②")),
            443,
        ),
        InventoryUnit::new(
            RowIndexRef(1647),
            200,
            UnitStatus::Stocked,
            Some(normalize("パレット①")),
            200,
        ),
    ])
    .with_served_env("test", "Test")
}

async fn print_board(store: &BoardStore) {
    let (columns, last_error) = store
        .state(|s| {
            let columns: Vec<(Column, Vec<String>)> = Column::ALL
                .iter()
                .map(|column| {
                    let cards = s
                        .board
                        .cards_in(*column)
                        .map(|unit| {
                            let location = unit.location.as_ref().map_or("-", |l| l.label.as_str());
                            format!("row {} x{} @ {location}", unit.row, unit.quantity_at_location)
                        })
                        .collect();
                    (*column, cards)
                })
                .collect();
            (columns, s.last_error.clone())
        })
        .await;

    for (column, cards) in columns {
        println!("  [{}]", column.as_str());
        for card in cards {
            println!("    {card}");
        }
    }
    if let Some(error) = last_error {
        println!("  last error: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packboard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
    if let Err(error) = metrics.start() {
        tracing::warn!(error = %error, "Metrics recorder not installed");
    }

    let config = BoardConfig::from_env()?;
    config.validate()?;
    tracing::info!(env = %config.env, "Configuration loaded");

    let client = UpdateClient::new(Arc::new(ReqwestTransport::new()));
    let backend: Arc<dyn InventoryBackend> = match HttpBackend::from_config(client, &config) {
        Some(backend) => Arc::new(backend),
        None => {
            tracing::info!("No backend URL configured, using seeded in-memory backend");
            Arc::new(seeded_backend())
        },
    };

    let clock = Arc::new(SystemClock);
    let keys = IdempotencyKeyStore::with_ttl(
        Arc::new(InMemoryKeyValueStore::new()),
        clock.clone(),
        config.idempotency_ttl(),
    );
    let env = BoardEnvironment::new(clock, keys, backend).with_operator("demo");
    let store = BoardStore::new(BoardState::new(config.env), BoardReducer::new(), env);

    let query_timeout = config.query_timeout();
    let update_timeout = config.update_timeout() * 4;

    println!("=== Packboard ===\n");
    println!(">>> Refresh");
    store
        .send_and_wait_for(
            BoardAction::Refresh { filter: None },
            |a| matches!(a, BoardAction::QueryCompleted { .. }),
            query_timeout,
        )
        .await?;
    print_board(&store).await;

    let first_manufactured = store
        .state(|s| s.board.cards_in(Column::Manufactured).next().cloned())
        .await;

    if let Some(unit) = first_manufactured {
        let quantity = (unit.quantity_at_location / 4).max(1);
        println!("\n>>> Pack {quantity} of row {} at Pallet 1", unit.row);
        store
            .send_and_wait_for(
                BoardAction::Pack {
                    card: card_id(&unit),
                    quantity,
                    location: "Pallet 1".to_string(),
                },
                |a| {
                    matches!(
                        a,
                        BoardAction::QueryCompleted { .. } | BoardAction::UpdateFailed { .. }
                    )
                },
                update_timeout,
            )
            .await?;
        print_board(&store).await;
    }

    store.shutdown(Duration::from_secs(5)).await?;

    if let Some(rendered) = metrics.render() {
        println!("\n=== Metrics ===\n{rendered}");
    }
    Ok(())
}
