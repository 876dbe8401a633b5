use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use inventory_service::api as inventory_api;
use inventory_service::handlers::SettlementHandler;
use inventory_service::{InventoryConfig, InventoryService, InventoryStore};
use order_service::api as order_api;
use order_service::handlers::ReconciliationHandler;
use order_service::outbox::OutboxProcessor;
use order_service::{OrderConfig, OrderService, OrderStore};
use shared::channel::{ChannelClient, ConsumerLoop, InMemoryBroker};
use shared::messages::{RECONCILE_TOPIC, SETTLEMENT_TOPIC};

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub outbox_interval: Duration,
    pub reserve_timeout: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            outbox_interval: Duration::from_secs(5),
            reserve_timeout: Duration::from_secs(3),
        }
    }
}

/// Both services, the broker between them, and every background task,
/// wired together in one process. Must be started inside a tokio runtime.
pub struct StorefrontSystem {
    pub broker: Arc<InMemoryBroker>,
    pub inventory: Arc<InventoryService>,
    pub orders: Arc<OrderService>,
    pub inventory_store: Arc<InventoryStore>,
    pub order_store: Arc<OrderStore>,
    publisher: Arc<ChannelClient>,
    shutdown: watch::Sender<bool>,
    timer_handles: Vec<JoinHandle<()>>,
    consumer_handles: Vec<JoinHandle<()>>,
}

impl StorefrontSystem {
    pub fn start(config: SystemConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let inventory_store = Arc::new(InventoryStore::new());
        let order_store = Arc::new(OrderStore::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inventory = Arc::new(InventoryService::new(
            Arc::clone(&inventory_store),
            InventoryConfig {
                reservation_ttl: config.reservation_ttl,
                sweep_interval: config.sweep_interval,
            },
        ));
        let publisher = Arc::new(ChannelClient::new(Arc::clone(&broker)));
        let orders = Arc::new(OrderService::new(
            Arc::clone(&order_store),
            Arc::clone(&inventory) as Arc<dyn shared::reservation::ReservationApi>,
            Arc::clone(&publisher),
            OrderConfig {
                reserve_timeout: config.reserve_timeout,
            },
        ));

        let mut consumer_handles = Vec::new();
        let settlement_loop = ConsumerLoop::new(
            SETTLEMENT_TOPIC,
            broker.subscribe(SETTLEMENT_TOPIC),
            Arc::clone(&publisher),
            SettlementHandler::new(Arc::clone(&inventory_store), Arc::clone(&publisher)),
        );
        consumer_handles.push(tokio::spawn(settlement_loop.run()));

        let reconcile_loop = ConsumerLoop::new(
            RECONCILE_TOPIC,
            broker.subscribe(RECONCILE_TOPIC),
            Arc::clone(&publisher),
            ReconciliationHandler::new(Arc::clone(&order_store)),
        );
        consumer_handles.push(tokio::spawn(reconcile_loop.run()));

        let mut timer_handles = Vec::new();
        timer_handles.push(tokio::spawn(
            Arc::clone(&inventory).run_expiry_sweeper(shutdown_rx.clone()),
        ));
        let outbox = OutboxProcessor::new(
            Arc::clone(&order_store),
            Arc::clone(&publisher),
            config.outbox_interval,
        );
        timer_handles.push(tokio::spawn(outbox.run(shutdown_rx)));

        info!("storefront system started");
        Self {
            broker,
            inventory,
            orders,
            inventory_store,
            order_store,
            publisher,
            shutdown,
            timer_handles,
            consumer_handles,
        }
    }

    /// Order and inventory routes merged behind one listener.
    pub fn router(&self) -> Router {
        let order_router = order_api::create_router(order_api::AppState {
            service: Arc::clone(&self.orders),
        });
        let inventory_router = inventory_api::create_router(inventory_api::AppState {
            service: Arc::clone(&self.inventory),
        });
        Router::new()
            .route("/health", get(health_check))
            .merge(order_router)
            .merge(inventory_router)
            .layer(
                tower_http::cors::CorsLayer::new()
                    .allow_origin(tower_http::cors::Any)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
            )
    }

    /// Stop timers, let the outbox take its final pass, then close the
    /// broker so consumers drain what is left and exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down storefront system");
        let _ = self.shutdown.send(true);
        for handle in self.timer_handles {
            if let Err(err) = handle.await {
                error!("background task panicked: {err}");
            }
        }

        self.publisher.close();
        self.broker.close();
        for result in join_all(self.consumer_handles).await {
            if let Err(err) = result {
                error!("consumer task panicked: {err}");
            }
        }
        info!("storefront system stopped");
        Ok(())
    }
}

async fn health_check() -> &'static str {
    "OK"
}
