//! 流式投递层：帧格式、按连接的协作式取消、投递协议

pub mod cancel;
pub mod delivery;
pub mod message;

pub use cancel::CancelRegistry;
pub use delivery::{
    extract_media, Answer, DeliveryExtras, DeliveryOutcome, DeliveryStatus, DeliveryTarget, StreamDelivery,
    TurnRecord,
};
pub use message::{Frame, FrameSink, StreamMessage};
