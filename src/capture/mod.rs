pub mod dmabuf;

pub use dmabuf::{sampling_transform, CapturedFrame, DmabufPlane, DmabufProducer, DmabufStream};
