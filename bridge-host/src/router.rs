//! Action dispatch and request validation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bridge_core::envelope::{self, ColorSpec, ImageSpec, Request, ResponseEnvelope, StatusReport};
use bridge_core::http::HttpRequest;
use serde_json::{json, Value};

use crate::exec::{ExecError, ExecutionBridge, COLOR_POLL_LIMIT, IMAGE_POLL_LIMIT};
use crate::relay::{ImageSource, RelayError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handler failure. The split matters on the HTTP path: bad input is the
/// caller's fault (400), everything past validation is the host's (500).
#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// What goes back over the wire: a response envelope or a status report.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(ResponseEnvelope),
    Status(StatusReport),
}

impl Reply {
    pub fn to_json(&self) -> String {
        let result = match self {
            Reply::Response(r) => serde_json::to_string(r),
            Reply::Status(s) => serde_json::to_string(s),
        };
        // Envelopes only hold JSON-safe types; this cannot fail in practice.
        result.unwrap_or_else(|_| r#"{"action":"response","success":false,"error":"serialization failed"}"#.to_string())
    }
}

/// Routes decoded requests to handlers. Shared across connection threads.
pub struct Router {
    bridge: ExecutionBridge,
    images: Arc<dyn ImageSource>,
    port: u16,
}

impl Router {
    pub fn new(bridge: ExecutionBridge, images: Arc<dyn ImageSource>, port: u16) -> Self {
        Self {
            bridge,
            images,
            port,
        }
    }

    /// One text message in, one reply out. Parse errors and unknown actions
    /// come back as failure envelopes; the connection stays open.
    pub fn route_text(&self, text: &str) -> Reply {
        let msg = match envelope::parse_request(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("unparseable message: {e}");
                return Reply::Response(ResponseEnvelope::err(None, format!("invalid JSON: {e}")));
            }
        };
        let id = msg.id;
        match msg.decode() {
            Ok(Request::SendColor(spec)) => {
                Reply::Response(envelope_for("sendColor", self.handle_color(&spec)).with_id(id))
            }
            Ok(Request::SendImage(spec)) => {
                Reply::Response(envelope_for("sendImage", self.handle_image(&spec)).with_id(id))
            }
            Ok(Request::CheckConnection) => Reply::Status(self.status_report().with_id(id)),
            Ok(Request::Unknown(action)) => {
                log::warn!("unknown action: {action}");
                Reply::Response(
                    ResponseEnvelope::err(Some(&action), format!("unknown action: {action}"))
                        .with_id(id),
                )
            }
            Err(e) => Reply::Response(
                ResponseEnvelope::err(Some(&msg.action), e.to_string()).with_id(id),
            ),
        }
    }

    /// One-shot HTTP fallback: `GET /status`, `POST /color`, `POST /image`.
    pub fn route_http(&self, req: &HttpRequest) -> (u16, String) {
        log::info!("http request: {} {}", req.method, req.path);
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/status") => {
                let reply = Reply::Status(self.status_report());
                (200, reply.to_json())
            }
            ("POST", "/color") => self.http_body(req, "sendColor"),
            ("POST", "/image") => self.http_body(req, "sendImage"),
            (_, "/status" | "/color" | "/image") => {
                (405, json!({ "error": "method not allowed" }).to_string())
            }
            _ => (404, json!({ "error": "not found" }).to_string()),
        }
    }

    fn http_body(&self, req: &HttpRequest, action: &str) -> (u16, String) {
        let payload: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(e) => return (400, json!({ "error": format!("invalid JSON: {e}") }).to_string()),
        };
        let outcome = match action {
            "sendColor" => match envelope::decode_color(&payload) {
                Ok(spec) => self.handle_color(&spec),
                Err(e) => Err(HandlerError::Validation(e.to_string())),
            },
            _ => match envelope::decode_image(&payload) {
                Ok(spec) => self.handle_image(&spec),
                Err(e) => Err(HandlerError::Validation(e.to_string())),
            },
        };
        let status = match &outcome {
            Ok(_) => 200,
            Err(HandlerError::Validation(_)) => 400,
            Err(_) => 500,
        };
        (status, Reply::Response(envelope_for(action, outcome)).to_json())
    }

    /// Validate channels and create the color material on the model thread.
    /// Out-of-range values are an error naming them, never clamped.
    fn handle_color(&self, spec: &ColorSpec) -> Result<Value, HandlerError> {
        let (r, g, b) = (spec.r, spec.g, spec.b);
        let in_range = |v: i64| (0..=255).contains(&v);
        if !in_range(r) || !in_range(g) || !in_range(b) {
            return Err(HandlerError::Validation(format!(
                "invalid RGB values: r={r}, g={g}, b={b}"
            )));
        }
        let (r, g, b) = (r as u8, g as u8, b as u8);
        let hex = spec.hex.clone();
        let data = self.bridge.run_to_completion(
            move |model| {
                let name = model.create_color_material(r, g, b, hex.as_deref());
                Ok(json!({ "name": name, "message": "material created" }))
            },
            COLOR_POLL_LIMIT,
        )?;
        Ok(data)
    }

    /// Validate the kind, fetch the staged bytes, then create the material or
    /// component on the model thread.
    fn handle_image(&self, spec: &ImageSpec) -> Result<Value, HandlerError> {
        if spec.kind != "material" && spec.kind != "component" {
            return Err(HandlerError::Validation(format!(
                "invalid type: {}",
                spec.kind
            )));
        }
        let png = self.images.fetch(&spec.image_id)?;
        let kind = spec.kind.clone();
        let image_id = spec.image_id.clone();
        let data = self.bridge.run_to_completion(
            move |model| {
                let name = if kind == "material" {
                    model.create_image_material(&png, &image_id)?
                } else {
                    model.create_image_component(&png, &image_id)?
                };
                Ok(json!({ "name": name, "type": kind, "message": format!("{kind} created") }))
            },
            IMAGE_POLL_LIMIT,
        )?;
        Ok(data)
    }

    fn status_report(&self) -> StatusReport {
        StatusReport::new(
            format!("bridge server active on port {}", self.port),
            VERSION,
            epoch_secs(),
        )
    }
}

fn envelope_for(action: &str, outcome: Result<Value, HandlerError>) -> ResponseEnvelope {
    match outcome {
        Ok(data) => ResponseEnvelope::ok(action, data),
        Err(e) => ResponseEnvelope::err(Some(action), e.to_string()),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ModelLoop;
    use crate::model::{test_png, Model};
    use crate::relay::RelayError;
    use std::thread;
    use std::time::Duration;

    struct FakeImages;

    impl ImageSource for FakeImages {
        fn fetch(&self, image_id: &str) -> Result<Vec<u8>, RelayError> {
            match image_id {
                "missing" => Err(RelayError::Rejected("image not found".to_string())),
                _ => Ok(test_png(200, 100)),
            }
        }
    }

    fn router() -> (Router, thread::JoinHandle<()>) {
        let (model_loop, bridge) = ModelLoop::new(Model::new(1.0));
        let handle = thread::spawn(move || model_loop.run());
        let bridge = bridge.with_poll_interval(Duration::from_millis(5));
        (Router::new(bridge, Arc::new(FakeImages), 8080), handle)
    }

    fn response(reply: Reply) -> ResponseEnvelope {
        match reply {
            Reply::Response(r) => r,
            Reply::Status(s) => panic!("expected response, got status: {s:?}"),
        }
    }

    #[test]
    fn send_color_creates_material() {
        let (router, _h) = router();
        let reply = response(router.route_text(
            r##"{"id":1,"action":"sendColor","payload":{"r":255,"g":0,"b":64,"hex":"#FF0040"}}"##,
        ));
        assert!(reply.success);
        assert_eq!(reply.id, Some(1));
        assert_eq!(reply.original_action.as_deref(), Some("sendColor"));
        let name = reply.data.unwrap()["name"].as_str().unwrap().to_string();
        assert!(name.starts_with("Color_FF0040_"));
    }

    #[test]
    fn out_of_range_color_names_the_values() {
        let (router, _h) = router();
        let reply = response(router.route_text(
            r#"{"id":2,"action":"sendColor","payload":{"r":300,"g":-1,"b":128}}"#,
        ));
        assert!(!reply.success);
        assert_eq!(reply.id, Some(2));
        assert_eq!(
            reply.error.as_deref(),
            Some("invalid RGB values: r=300, g=-1, b=128")
        );
    }

    #[test]
    fn missing_color_field_is_descriptive() {
        let (router, _h) = router();
        let reply =
            response(router.route_text(r#"{"action":"sendColor","payload":{"r":1,"g":2}}"#));
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("missing or invalid field `b`"));
    }

    #[test]
    fn send_image_material_and_component() {
        let (router, _h) = router();
        for (kind, prefix) in [
            ("material", "Image_Material_img_9_"),
            ("component", "Image_Component_img_9_"),
        ] {
            let reply = response(router.route_text(&format!(
                r#"{{"id":5,"action":"sendImage","payload":{{"imageId":"img_9","type":"{kind}"}}}}"#
            )));
            assert!(reply.success, "kind {kind} failed: {:?}", reply.error);
            let data = reply.data.unwrap();
            assert!(data["name"].as_str().unwrap().starts_with(prefix));
            assert_eq!(data["type"], kind);
        }
    }

    #[test]
    fn invalid_image_type_fails_before_fetch() {
        let (router, _h) = router();
        let reply = response(router.route_text(
            r#"{"action":"sendImage","payload":{"imageId":"img_9","type":"texture"}}"#,
        ));
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("invalid type: texture"));
    }

    #[test]
    fn relay_failure_surfaces_in_envelope() {
        let (router, _h) = router();
        let reply = response(router.route_text(
            r#"{"action":"sendImage","payload":{"imageId":"missing","type":"material"}}"#,
        ));
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("image not found"));
    }

    #[test]
    fn check_connection_status_report() {
        let (router, _h) = router();
        match router.route_text(r#"{"id":3,"action":"checkConnection"}"#) {
            Reply::Status(status) => {
                assert_eq!(status.action, "connectionStatus");
                assert!(status.is_connected);
                assert_eq!(status.version, VERSION);
                assert!(status.timestamp > 0);
                assert_eq!(status.id, Some(3));
                assert!(status.message.contains("8080"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn unknown_action_and_parse_error() {
        let (router, _h) = router();
        let reply = response(router.route_text(r#"{"id":4,"action":"sendVideo"}"#));
        assert!(!reply.success);
        assert_eq!(reply.id, Some(4));
        assert_eq!(reply.error.as_deref(), Some("unknown action: sendVideo"));

        let reply = response(router.route_text("{broken"));
        assert!(!reply.success);
        assert!(reply.error.unwrap().starts_with("invalid JSON:"));
        assert_eq!(reply.id, None);
    }

    #[test]
    fn http_routes() {
        let (router, _h) = router();
        let get = |method: &str, path: &str, body: &[u8]| HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: body.to_vec(),
        };

        let (status, body) = router.route_http(&get("GET", "/status", b""));
        assert_eq!(status, 200);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["action"], "connectionStatus");

        let (status, body) =
            router.route_http(&get("POST", "/color", br#"{"r":10,"g":20,"b":30}"#));
        assert_eq!(status, 200);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["success"], true);

        let (status, body) = router.route_http(&get("POST", "/color", b"{broken"));
        assert_eq!(status, 400);
        assert!(body.contains("invalid JSON"));

        let (status, body) =
            router.route_http(&get("POST", "/color", br#"{"r":300,"g":0,"b":0}"#));
        assert_eq!(status, 400);
        assert!(body.contains("invalid RGB values"));

        let (status, body) = router.route_http(&get(
            "POST",
            "/image",
            br#"{"imageId":"missing","type":"material"}"#,
        ));
        assert_eq!(status, 500);
        assert!(body.contains("image not found"));

        let (status, _) = router.route_http(&get("GET", "/color", b""));
        assert_eq!(status, 405);

        let (status, _) = router.route_http(&get("GET", "/nope", b""));
        assert_eq!(status, 404);

        let (status, body) = router.route_http(&get(
            "POST",
            "/image",
            br#"{"imageId":"img_1","type":"material"}"#,
        ));
        assert_eq!(status, 200);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["success"], true);
    }
}
