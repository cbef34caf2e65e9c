use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize, Serialize)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Value,
}

#[derive(Deserialize, Serialize)]
pub struct PublishResponse {
    pub seq: u64,
}

#[derive(Deserialize, Serialize)]
pub struct SubscribeRequest {
    pub topic: String,
    pub cursor: u64,
}

// empty when nothing was published within the poll interval
#[derive(Deserialize, Serialize)]
pub struct SubscribeResponse {
    pub values: Vec<Value>,
}

#[derive(Deserialize, Serialize)]
pub struct SignalRequest {
    pub state: String,
}

#[derive(Deserialize, Serialize)]
pub struct SignalResponse {
    pub seq: u64,
}

#[derive(Deserialize, Serialize)]
pub struct BarrierRequest {
    pub state: String,
    pub target: u64,
}

#[derive(Deserialize, Serialize)]
pub struct BarrierResponse {
    pub count: u64,
    pub reached: bool,
}
