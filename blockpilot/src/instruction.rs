//! Compiled command scripts
//!
//! A `CommandScript` is the immutable output of one compilation. Control
//! structures own a nested script instead of being flattened into the parent.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "left" => Some(MouseButton::Left),
            "right" => Some(MouseButton::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            _ => None,
        }
    }
}

/// Which point of a matched image the cursor is moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageAnchor {
    Center,
    TopLeft,
}

impl ImageAnchor {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "center" => Some(ImageAnchor::Center),
            "topleft" => Some(ImageAnchor::TopLeft),
            _ => None,
        }
    }
}

/// A remote primitive. Each variant maps to exactly one kind of remote call
/// (or, for `MoveToImage`, one search followed by one move).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Click {
        x: i64,
        y: i64,
    },
    Move {
        x: i64,
        y: i64,
    },
    MoveAbsolute {
        x: i64,
        y: i64,
    },
    MoveRelative {
        dx: i64,
        dy: i64,
    },
    MoveToImage {
        image: String,
        anchor: ImageAnchor,
    },
    Scroll {
        amount: i64,
        direction: ScrollDirection,
    },
    SingleClick {
        button: MouseButton,
    },
    DoubleClick {
        button: MouseButton,
    },
    TripleClick {
        button: MouseButton,
    },
    LongPress {
        button: MouseButton,
        duration_secs: f64,
    },
    Release {
        button: MouseButton,
    },
    MiddleClick,
    KeyPress {
        key: String,
    },
    TypeText {
        text: String,
    },
    OpenUrl {
        url: String,
        wait_for_load: bool,
        wait_time_secs: f64,
    },
    RefreshBrowser,
    WaitForElement {
        image: String,
        timeout_secs: f64,
        /// Percentage as shown in the editor (0-100).
        confidence_percent: f64,
    },
}

impl Command {
    /// Short operation label used in error fallbacks and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Click { .. } => "click",
            Command::Move { .. } => "move",
            Command::MoveAbsolute { .. } => "move-absolute",
            Command::MoveRelative { .. } => "move-relative",
            Command::MoveToImage { .. } => "move-to-image",
            Command::Scroll { .. } => "scroll",
            Command::SingleClick { .. } => "single-click",
            Command::DoubleClick { .. } => "double-click",
            Command::TripleClick { .. } => "triple-click",
            Command::LongPress { .. } => "long-press",
            Command::Release { .. } => "release",
            Command::MiddleClick => "middle-click",
            Command::KeyPress { .. } => "key-press",
            Command::TypeText { .. } => "type-text",
            Command::OpenUrl { .. } => "open-url",
            Command::RefreshBrowser => "refresh-browser",
            Command::WaitForElement { .. } => "wait-for-element",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Click { x, y } => write!(f, "Click at ({x}, {y})"),
            Command::Move { x, y } => write!(f, "Move mouse to ({x}, {y})"),
            Command::MoveAbsolute { x, y } => write!(f, "Move mouse to absolute ({x}, {y})"),
            Command::MoveRelative { dx, dy } => write!(f, "Move mouse by ({dx}, {dy})"),
            Command::MoveToImage { image, anchor } => {
                let point = match anchor {
                    ImageAnchor::Center => "center",
                    ImageAnchor::TopLeft => "top-left corner",
                };
                write!(f, "Move mouse to the {point} of image '{image}'")
            }
            Command::Scroll { amount, direction } => {
                write!(f, "Scroll {} {amount}", direction.as_str())
            }
            Command::SingleClick { button } => write!(f, "Single click ({})", button.as_str()),
            Command::DoubleClick { button } => write!(f, "Double click ({})", button.as_str()),
            Command::TripleClick { button } => write!(f, "Triple click ({})", button.as_str()),
            Command::LongPress {
                button,
                duration_secs,
            } => write!(f, "Long press ({}) for {duration_secs}s", button.as_str()),
            Command::Release { button } => write!(f, "Release ({})", button.as_str()),
            Command::MiddleClick => write!(f, "Middle click"),
            Command::KeyPress { key } => write!(f, "Press key '{key}'"),
            Command::TypeText { text } => write!(f, "Type text '{text}'"),
            Command::OpenUrl {
                url,
                wait_for_load,
                wait_time_secs,
            } => {
                if *wait_for_load {
                    write!(f, "Open URL {url} (wait {wait_time_secs}s)")
                } else {
                    write!(f, "Open URL {url}")
                }
            }
            Command::RefreshBrowser => write!(f, "Refresh browser"),
            Command::WaitForElement {
                image,
                timeout_secs,
                confidence_percent,
            } => write!(
                f,
                "Wait for image '{image}' (timeout {timeout_secs}s, confidence {confidence_percent}%)"
            ),
        }
    }
}

/// One compiled, fully resolved step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// Dispatched to the remote command client.
    Command { command: Command },
    /// Pauses the session locally.
    Wait { seconds: f64 },
    /// Runs `body` `times` times, checking for cancellation before each pass.
    Repeat { times: u64, body: CommandScript },
}

impl Instruction {
    pub fn command(command: Command) -> Self {
        Instruction::Command { command }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Command { command } => command.fmt(f),
            Instruction::Wait { seconds } => write!(f, "Wait {seconds}s"),
            Instruction::Repeat { times, body } => {
                write!(f, "Repeat {times} times ({} steps)", body.len())
            }
        }
    }
}

/// Ordered, immutable sequence of instructions for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandScript {
    instructions: Vec<Instruction>,
}

impl CommandScript {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }
}

impl<'a> IntoIterator for &'a CommandScript {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl FromIterator<Instruction> for CommandScript {
    fn from_iter<I: IntoIterator<Item = Instruction>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Screen location returned by an image search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub center_x: f64,
    pub center_y: f64,
}

impl Location {
    pub fn anchor(&self, anchor: ImageAnchor) -> (f64, f64) {
        match anchor {
            ImageAnchor::Center => (self.center_x, self.center_y),
            ImageAnchor::TopLeft => (self.x, self.y),
        }
    }
}
