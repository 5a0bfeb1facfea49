pub mod checkout;
pub mod common;
pub mod coupons;
pub mod orders;
pub mod payments;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::payments::PaymentGateway;
use crate::services::commerce::{
    settlement_service::SettlementSettings, CatalogService, CouponService, OrderService,
    PricingService, ReconciliationService, SettlementService,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub coupons: Arc<CouponService>,
    pub pricing: Arc<PricingService>,
    pub settlement: Arc<SettlementService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub orders: Arc<OrderService>,
}

impl AppServices {
    /// Wires every settlement service against one pool, one gateway and one
    /// event channel.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Self {
        let catalog = Arc::new(CatalogService::new(db_pool.clone()));
        let coupons = Arc::new(CouponService::new(db_pool.clone()));
        let pricing = Arc::new(PricingService::new((&config.shipping).into()));

        let settlement = Arc::new(SettlementService::new(
            db_pool.clone(),
            catalog.clone(),
            coupons.clone(),
            pricing.clone(),
            gateway.clone(),
            event_sender.clone(),
            SettlementSettings::from(config),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db_pool.clone(),
            gateway,
            event_sender,
            config.gateway.clone(),
        ));
        let orders = Arc::new(OrderService::new(db_pool));

        Self {
            catalog,
            coupons,
            pricing,
            settlement,
            reconciliation,
            orders,
        }
    }
}
