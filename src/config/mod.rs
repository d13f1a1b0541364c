pub mod schema;

pub use schema::{
    build_http_client, Config, DeliveryConfig, DocumentConfig, LarkConfig, CHUNK_PREFIX_HEADROOM,
    LARK_MESSAGE_CEILING,
};
