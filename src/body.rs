use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type HubBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> HubBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(bytes: Bytes) -> HubBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn json_body(value: &impl serde::Serialize) -> HubBody {
    match serde_json::to_vec(value) {
        Ok(bytes) => full_body(Bytes::from(bytes)),
        Err(_) => full_body(Bytes::from_static(b"{}")),
    }
}
