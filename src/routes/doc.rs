use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        orders::{CreateOrderRequest, CreateOrderResponse, OrderList, OrderWithItems},
        webhooks::WebhookAck,
    },
    models::{Address, Coupon, InventoryLevel, Order, OrderItem, OrderSummary, Product, PurchaseEvent},
    response::{ApiResponse, Meta},
    routes::{health, orders, params, webhooks},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        orders::create_order,
        orders::list_orders,
        orders::get_order,
        webhooks::payment_webhook,
    ),
    components(
        schemas(
            Product,
            InventoryLevel,
            Address,
            Coupon,
            Order,
            OrderItem,
            OrderSummary,
            PurchaseEvent,
            CreateOrderRequest,
            CreateOrderResponse,
            OrderList,
            OrderWithItems,
            WebhookAck,
            params::Pagination,
            params::OrderListQuery,
            Meta,
            ApiResponse<CreateOrderResponse>,
            ApiResponse<OrderList>,
            ApiResponse<OrderWithItems>,
            ApiResponse<WebhookAck>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Orders", description = "Order creation and reads"),
        (name = "Webhooks", description = "Payment gateway callbacks"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
