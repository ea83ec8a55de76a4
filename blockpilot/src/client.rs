//! Remote command client
//!
//! Maps each [`Command`] to exactly one remote call (two for image-based
//! moves) and folds transport and application failures into [`RemoteError`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::RemoteError;
use crate::instruction::{Command, Location};

/// Search window used when moving the cursor onto a named image.
pub const MOVE_TO_IMAGE_TIMEOUT_SECS: f64 = 5.0;
pub const MOVE_TO_IMAGE_CONFIDENCE_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// One outbound request: a route, a method and an optional JSON payload.
///
/// `path` holds raw, unencoded segments; the transport is responsible for
/// percent-encoding them, so names containing `/` or spaces stay one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommand {
    pub label: &'static str,
    pub method: Method,
    pub path: Vec<String>,
    pub payload: Option<Value>,
}

impl RemoteCommand {
    fn new(label: &'static str, method: Method, route: &str) -> Self {
        Self {
            label,
            method,
            path: route
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
            payload: None,
        }
    }

    pub fn get(label: &'static str, route: &str) -> Self {
        Self::new(label, Method::Get, route)
    }

    pub fn post(label: &'static str, route: &str, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(label, Method::Post, route)
        }
    }

    pub fn delete(label: &'static str, route: &str) -> Self {
        Self::new(label, Method::Delete, route)
    }

    /// Appends a caller-supplied name as a single path segment.
    pub fn with_segment(mut self, segment: &str) -> Self {
        self.path.push(segment.to_string());
        self
    }

    pub fn route(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

/// Raw outcome of one request, before error normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Parsed JSON body, `Value::Null` when the body was empty or not JSON.
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response carrier underneath [`RemoteCommandClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: &RemoteCommand) -> Result<RemoteResponse, RemoteError>;
}

/// What the execution engine needs from the remote side.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Performs one command. Image searches return the matched location.
    async fn execute(&self, command: &Command) -> Result<Option<Location>, RemoteError>;

    async fn set_failsafe(&self, enabled: bool) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
}

/// Stored image payload, a `data:` URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub name: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedProgram {
    #[serde(default)]
    pub name: String,
    /// Serialized workspace document.
    pub data: String,
    #[serde(rename = "failsafeEnabled", default = "default_failsafe")]
    pub failsafe_enabled: bool,
}

fn default_failsafe() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: i64,
    pub y: i64,
}

#[derive(Deserialize)]
struct LocationBody {
    location: Location,
}

#[derive(Deserialize)]
struct ImageBody {
    image: ImageData,
}

#[derive(Deserialize)]
struct ImageListBody {
    #[serde(default)]
    images: Vec<ImageAsset>,
}

#[derive(Deserialize)]
struct ProgramListBody {
    #[serde(default)]
    programs: Vec<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: String,
}

pub struct RemoteCommandClient<T> {
    transport: T,
}

impl<T: Transport> RemoteCommandClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn call(&self, command: RemoteCommand) -> Result<Value, RemoteError> {
        debug!("{:?} {} ({})", command.method, command.route(), command.label);
        let response = self.transport.send(&command).await?;
        if response.is_success() {
            return Ok(response.body);
        }

        let message = response
            .body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} failed (status {})", command.label, response.status));
        warn!("{} returned {}: {}", command.route(), response.status, message);
        Err(RemoteError::new(message))
    }

    async fn call_as<R: DeserializeOwned>(&self, command: RemoteCommand) -> Result<R, RemoteError> {
        let label = command.label;
        let body = self.call(command).await?;
        serde_json::from_value(body)
            .map_err(|e| RemoteError::new(format!("Unexpected response to {label}: {e}")))
    }

    pub async fn list_images(&self) -> Result<Vec<ImageAsset>, RemoteError> {
        let body: ImageListBody = self
            .call_as(RemoteCommand::get("list-images", "/api/images/list"))
            .await?;
        Ok(body.images)
    }

    pub async fn get_image(&self, name: &str) -> Result<ImageData, RemoteError> {
        let body: ImageBody = self
            .call_as(RemoteCommand::get("get-image", "/api/images/get").with_segment(name))
            .await?;
        Ok(body.image)
    }

    /// Server-side search by name. Not used when running programs.
    pub async fn find_image(&self, name: &str) -> Result<Location, RemoteError> {
        let body: LocationBody = self
            .call_as(RemoteCommand::post(
                "find-image",
                "/api/images/find",
                json!({ "imageName": name }),
            ))
            .await?;
        Ok(body.location)
    }

    pub async fn upload_image(&self, name: &str, data_url: &str) -> Result<(), RemoteError> {
        self.call(RemoteCommand::post(
            "upload-image",
            "/api/images/upload",
            json!({ "name": name, "imageData": data_url }),
        ))
        .await?;
        Ok(())
    }

    pub async fn delete_image(&self, name: &str) -> Result<String, RemoteError> {
        let body = self
            .call(RemoteCommand::delete("delete-image", "/api/images/delete").with_segment(name))
            .await?;
        let message = serde_json::from_value::<MessageBody>(body)
            .map(|b| b.message)
            .unwrap_or_default();
        Ok(message)
    }

    pub async fn save_program(&self, program: &SavedProgram) -> Result<(), RemoteError> {
        self.call(RemoteCommand::post(
            "save-program",
            "/api/save",
            json!({
                "name": program.name,
                "data": program.data,
                "failsafeEnabled": program.failsafe_enabled,
            }),
        ))
        .await?;
        Ok(())
    }

    pub async fn load_program(&self, name: &str) -> Result<SavedProgram, RemoteError> {
        let mut program: SavedProgram = self
            .call_as(RemoteCommand::get("load-program", "/api/load").with_segment(name))
            .await?;
        if program.name.is_empty() {
            program.name = name.to_string();
        }
        Ok(program)
    }

    pub async fn list_programs(&self) -> Result<Vec<String>, RemoteError> {
        let body: ProgramListBody = self
            .call_as(RemoteCommand::get("list-programs", "/api/programs"))
            .await?;
        Ok(body.programs)
    }

    pub async fn cursor_position(&self) -> Result<CursorPosition, RemoteError> {
        self.call_as(RemoteCommand::get("cursor-position", "/api/position"))
            .await
    }

    /// Resolves `image` to its payload, then asks the remote side to wait for it.
    async fn locate(
        &self,
        image: &str,
        timeout_secs: f64,
        confidence_percent: f64,
    ) -> Result<Location, RemoteError> {
        if image.is_empty() {
            return Err(RemoteError::new("Image name not specified"));
        }
        let payload = self
            .get_image(image)
            .await
            .map_err(|_| RemoteError::new(format!("Image '{image}' not found")))?;

        let body: LocationBody = self
            .call_as(RemoteCommand::post(
                "wait-for-element",
                "/api/browser/wait-for-element",
                json!({
                    "imageData": payload.data,
                    "timeout": timeout_secs,
                    "confidence": normalize_confidence(confidence_percent),
                }),
            ))
            .await?;
        Ok(body.location)
    }
}

/// Converts an editor percentage into the `[0, 1]` fraction the remote expects.
pub fn normalize_confidence(percent: f64) -> f64 {
    (percent / 100.0).clamp(0.0, 1.0)
}

#[async_trait]
impl<T: Transport> CommandExecutor for RemoteCommandClient<T> {
    async fn execute(&self, command: &Command) -> Result<Option<Location>, RemoteError> {
        let label = command.label();
        let request = match command {
            Command::Click { x, y } => {
                RemoteCommand::post(label, "/api/click", json!({ "x": x, "y": y }))
            }
            Command::Move { x, y } => {
                RemoteCommand::post(label, "/api/move", json!({ "x": x, "y": y }))
            }
            Command::MoveAbsolute { x, y } => RemoteCommand::post(
                label,
                "/api/mouse/move-absolute",
                json!({ "x": x, "y": y }),
            ),
            // The remote reads the offset from the same keys as absolute moves.
            Command::MoveRelative { dx, dy } => RemoteCommand::post(
                label,
                "/api/mouse/move-relative",
                json!({ "x": dx, "y": dy }),
            ),
            Command::MoveToImage { image, anchor } => {
                let location = self
                    .locate(
                        image,
                        MOVE_TO_IMAGE_TIMEOUT_SECS,
                        MOVE_TO_IMAGE_CONFIDENCE_PERCENT,
                    )
                    .await?;
                let (x, y) = location.anchor(*anchor);
                self.call(RemoteCommand::post(
                    label,
                    "/api/move",
                    json!({ "x": x.round() as i64, "y": y.round() as i64 }),
                ))
                .await?;
                return Ok(Some(location));
            }
            Command::Scroll { amount, direction } => RemoteCommand::post(
                label,
                "/api/scroll",
                json!({ "amount": amount, "direction": direction.as_str() }),
            ),
            Command::SingleClick { button } => RemoteCommand::post(
                label,
                "/api/mouse/single-click",
                json!({ "button": button.as_str() }),
            ),
            Command::DoubleClick { button } => RemoteCommand::post(
                label,
                "/api/mouse/double-click",
                json!({ "button": button.as_str() }),
            ),
            Command::TripleClick { button } => RemoteCommand::post(
                label,
                "/api/mouse/triple-click",
                json!({ "button": button.as_str() }),
            ),
            Command::LongPress {
                button,
                duration_secs,
            } => RemoteCommand::post(
                label,
                "/api/mouse/long-press",
                json!({ "button": button.as_str(), "duration": duration_secs }),
            ),
            Command::Release { button } => RemoteCommand::post(
                label,
                "/api/mouse/release",
                json!({ "button": button.as_str() }),
            ),
            Command::MiddleClick => {
                RemoteCommand::post(label, "/api/mouse/middle-click", json!({}))
            }
            Command::KeyPress { key } => {
                RemoteCommand::post(label, "/api/keypress", json!({ "key": key }))
            }
            Command::TypeText { text } => {
                RemoteCommand::post(label, "/api/type", json!({ "text": text }))
            }
            Command::OpenUrl {
                url,
                wait_for_load,
                wait_time_secs,
            } => RemoteCommand::post(
                label,
                "/api/browser/open-url",
                json!({
                    "url": url,
                    "waitForLoad": wait_for_load,
                    "waitTime": wait_time_secs,
                }),
            ),
            Command::RefreshBrowser => {
                RemoteCommand::post(label, "/api/browser/refresh", json!({}))
            }
            Command::WaitForElement {
                image,
                timeout_secs,
                confidence_percent,
            } => {
                let location = self
                    .locate(image, *timeout_secs, *confidence_percent)
                    .await?;
                return Ok(Some(location));
            }
        };

        self.call(request).await?;
        Ok(None)
    }

    async fn set_failsafe(&self, enabled: bool) -> Result<(), RemoteError> {
        self.call(RemoteCommand::post(
            "set-failsafe",
            "/api/set-failsafe",
            json!({ "failsafe": enabled }),
        ))
        .await?;
        Ok(())
    }
}
