#[path = "../downlink_codec.rs"]
mod downlink_codec;
use downlink_codec::{build_envelope, decode_frm_payload, push_topic, DEFAULT_F_PORT, DEFAULT_PAYLOAD_HEX};

// Offline helper: print the envelope and topic a downlink would use, without connecting.
// Usage:
//   cargo run --bin encode_downlink -- [--unconfirmed] [hex_payload] [port]
// Reads TTN_APP_ID and TTN_DEVICE_ID for the topic, or uses placeholders.
fn main() {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let app_id = std::env::var("TTN_APP_ID").unwrap_or_else(|_| "{app_id}".to_string());
    let device_id = std::env::var("TTN_DEVICE_ID").unwrap_or_else(|_| "{device_id}".to_string());

    match encode(&args, &app_id, &device_id) {
        Ok(lines) => {
            for l in lines {
                println!("{}", l);
            }
        }
        Err((code, msg)) => {
            println!("encode: ERR  {}", msg);
            std::process::exit(code);
        }
    }
}

/// Output lines for `args`, or (exit code, reason). Usage errors exit 2, encode errors 1.
fn encode(args: &[String], app_id: &str, device_id: &str) -> Result<Vec<String>, (i32, String)> {
    let confirmed = !args.iter().any(|a| a == "--unconfirmed");
    let positional = args.iter().filter(|a| a.as_str() != "--unconfirmed").collect::<Vec<_>>();
    let payload = positional.first().map(|s| s.as_str()).unwrap_or(DEFAULT_PAYLOAD_HEX);
    let port = match positional.get(1) {
        Some(p) => p.parse::<u16>().map_err(|e| (2, format!("invalid port {:?}: {}", p, e)))?,
        None => DEFAULT_F_PORT as u16,
    };

    let env = build_envelope(payload, port, confirmed).map_err(|e| (1, e.to_string()))?;
    let json = env.to_json().map_err(|e| (1, e.to_string()))?;
    let bytes = decode_frm_payload(&env.downlinks[0].frm_payload).map_err(|e| (1, format!("frm_payload round trip: {}", e)))?;
    Ok(vec![
        format!("encode: OK  {} byte(s)  hex={}  confirmed={}", bytes.len(), hex::encode_upper(&bytes), confirmed),
        format!("topic: {}", push_topic(app_id, device_id)),
        format!("message: {}", json),
    ])
}
