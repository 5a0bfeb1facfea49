//! Persistent settlement records and the read-only catalog they reference.

pub mod coupon;
pub mod coupon_usage;
pub mod course;
pub mod enrollment;
pub mod order;
pub mod order_item;
pub mod payment_session;
pub mod product;
pub mod product_variant;

pub use coupon::{DiscountType, Entity as Coupon, Model as CouponModel};
pub use coupon_usage::{Entity as CouponUsage, Model as CouponUsageModel};
pub use course::{Entity as Course, Model as CourseModel};
pub use enrollment::{Entity as Enrollment, EnrollmentStatus, Model as EnrollmentModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use payment_session::{Entity as PaymentSession, Model as PaymentSessionModel, SessionStatus};
pub use product::{Entity as Product, Model as ProductModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
