//! Argument lists as each network's browser library expects them
//! (`fbq(...)`, `ttq.track(...)`, `snaptr(...)`).

use bf_core::{ConversionEvent, EventKind, Network};
use serde_json::{json, Map, Value};

pub fn pixel_call(network: Network, event: &ConversionEvent) -> Vec<Value> {
    match network {
        Network::Facebook => facebook_call(event),
        Network::TikTok => tiktok_call(event),
        Network::Snapchat => vec![
            json!("track"),
            json!(event.kind.wire_name(Network::Snapchat)),
        ],
    }
}

fn facebook_call(event: &ConversionEvent) -> Vec<Value> {
    let mut args = vec![
        json!("track"),
        json!(event.kind.wire_name(Network::Facebook)),
    ];

    let params = event
        .custom_data
        .as_ref()
        .and_then(|d| serde_json::to_value(d).ok());

    let mut options = Map::new();
    if let Some(id) = &event.event_id {
        options.insert("eventID".to_string(), json!(id));
    }
    if let Some(Value::Object(matching)) = event
        .matching
        .as_ref()
        .and_then(|m| serde_json::to_value(m).ok())
    {
        options.extend(matching);
    }

    match (params, options.is_empty()) {
        (Some(p), true) => args.push(p),
        (p, false) => {
            args.push(p.unwrap_or_else(|| json!({})));
            args.push(Value::Object(options));
        }
        (None, true) => {}
    }
    args
}

fn tiktok_call(event: &ConversionEvent) -> Vec<Value> {
    match event.kind {
        EventKind::PageView => vec![json!("page")],
        kind => vec![json!("track"), json!(kind.wire_name(Network::TikTok))],
    }
}
