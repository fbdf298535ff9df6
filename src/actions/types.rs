//! Action protocol types.

use serde_json::{json, Value};
use std::time::Duration;

/// Upper bound of the screen-independent coordinate space.
pub const RELATIVE_COORDINATE_MAX: i64 = 1000;

/// A point in the model's screen-independent coordinate space.
///
/// Both components live in [0, 1000]; out-of-range input is clamped to the
/// boundary at construction, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelPoint {
    x: i64,
    y: i64,
}

impl RelPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self {
            x: x.clamp(0, RELATIVE_COORDINATE_MAX),
            y: y.clamp(0, RELATIVE_COORDINATE_MAX),
        }
    }

    pub fn x(&self) -> i64 {
        self.x
    }

    pub fn y(&self) -> i64 {
        self.y
    }

    /// Map to absolute pixels on a `width`×`height` screen:
    /// `(⌊x·W/1000⌋, ⌊y·H/1000⌋)`, clamped into `[0,W-1]×[0,H-1]`.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32) {
        let px = (self.x as u64 * width as u64 / RELATIVE_COORDINATE_MAX as u64) as u32;
        let py = (self.y as u64 * height as u64 / RELATIVE_COORDINATE_MAX as u64) as u32;
        (px.min(width.saturating_sub(1)), py.min(height.saturating_sub(1)))
    }
}

/// One device interaction requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Launch {
        app: String,
    },
    Tap {
        point: RelPoint,
        /// Present when the model flagged the tap as sensitive; its presence
        /// requires user confirmation before the tap is issued.
        sensitive_message: Option<String>,
    },
    DoubleTap {
        point: RelPoint,
    },
    LongPress {
        point: RelPoint,
    },
    Swipe {
        start: RelPoint,
        end: RelPoint,
    },
    Type {
        text: String,
    },
    Back,
    Home,
    Wait {
        duration: Duration,
    },
    TakeOver {
        message: String,
    },
    Finish {
        message: String,
    },
}

impl Action {
    /// Stable kind tag used in step payloads and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Launch { .. } => "launch",
            Action::Tap { .. } => "tap",
            Action::DoubleTap { .. } => "double_tap",
            Action::LongPress { .. } => "long_press",
            Action::Swipe { .. } => "swipe",
            Action::Type { .. } => "type",
            Action::Back => "back",
            Action::Home => "home",
            Action::Wait { .. } => "wait",
            Action::TakeOver { .. } => "take_over",
            Action::Finish { .. } => "finish",
        }
    }

    /// Whether this action ends the task on successful execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }

    /// Rebuild an action from the representation [`to_json`](Self::to_json)
    /// emits. Used when replaying recorded scripts; unknown or incomplete
    /// payloads yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let point = |key: &str| -> Option<RelPoint> {
            let list = value.get(key)?.as_array()?;
            Some(RelPoint::new(
                list.first()?.as_i64()?,
                list.get(1)?.as_i64()?,
            ))
        };
        let text = |key: &str| -> Option<String> {
            value.get(key)?.as_str().map(str::to_string)
        };

        match value.get("action")?.as_str()? {
            "launch" => Some(Action::Launch { app: text("app")? }),
            "tap" => Some(Action::Tap {
                point: point("element")?,
                sensitive_message: text("sensitive_message"),
            }),
            "double_tap" => Some(Action::DoubleTap {
                point: point("element")?,
            }),
            "long_press" => Some(Action::LongPress {
                point: point("element")?,
            }),
            "swipe" => Some(Action::Swipe {
                start: point("start")?,
                end: point("end")?,
            }),
            "type" => Some(Action::Type { text: text("text")? }),
            "back" => Some(Action::Back),
            "home" => Some(Action::Home),
            "wait" => Some(Action::Wait {
                duration: Duration::from_millis(value.get("duration_ms")?.as_u64()?),
            }),
            "take_over" => Some(Action::TakeOver {
                message: text("message")?,
            }),
            "finish" => Some(Action::Finish {
                message: text("message").unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Structured representation for step records and subscriber events.
    pub fn to_json(&self) -> Value {
        match self {
            Action::Launch { app } => json!({ "action": "launch", "app": app }),
            Action::Tap {
                point,
                sensitive_message,
            } => json!({
                "action": "tap",
                "element": [point.x(), point.y()],
                "sensitive_message": sensitive_message,
            }),
            Action::DoubleTap { point } => json!({
                "action": "double_tap",
                "element": [point.x(), point.y()],
            }),
            Action::LongPress { point } => json!({
                "action": "long_press",
                "element": [point.x(), point.y()],
            }),
            Action::Swipe { start, end } => json!({
                "action": "swipe",
                "start": [start.x(), start.y()],
                "end": [end.x(), end.y()],
            }),
            Action::Type { text } => json!({ "action": "type", "text": text }),
            Action::Back => json!({ "action": "back" }),
            Action::Home => json!({ "action": "home" }),
            Action::Wait { duration } => json!({
                "action": "wait",
                "duration_ms": duration.as_millis() as u64,
            }),
            Action::TakeOver { message } => {
                json!({ "action": "take_over", "message": message })
            }
            Action::Finish { message } => json!({ "action": "finish", "message": message }),
        }
    }
}
