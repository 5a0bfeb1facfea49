//! Settlement pipeline: catalog pricing, coupon rules, order assembly and
//! payment reconciliation.

pub mod catalog_service;
pub mod coupon_service;
pub mod order_service;
pub mod pricing_service;
pub mod reconciliation_service;
pub mod settlement_service;

pub use catalog_service::CatalogService;
pub use coupon_service::CouponService;
pub use order_service::OrderService;
pub use pricing_service::PricingService;
pub use reconciliation_service::ReconciliationService;
pub use settlement_service::SettlementService;
