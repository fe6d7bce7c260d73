/// Whiteboard drawing objects and per-tool paint semantics
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DrawingId, Result, SessionError, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrawingTool {
    Pen,
    Highlighter,
    Eraser,
    Shape,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Arrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawingPoint {
    pub x: f32,
    pub y: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl DrawingPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// How a drawing is composited onto what is already on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeMode {
    SourceOver,
    DestinationOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaintStyle {
    pub color: String,
    pub width: f32,
    pub alpha: f32,
    /// Shadow blur radius, zero for no glow
    pub glow: f32,
    pub composite: CompositeMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: DrawingId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub tool: DrawingTool,
    pub color: String,
    pub stroke_width: f32,
    pub points: Vec<DrawingPoint>,
    #[serde(default)]
    pub shape: Option<ShapeKind>,
    #[serde(default)]
    pub text: Option<String>,
    /// Set on pointer-up; finished drawings never change again
    #[serde(default)]
    pub finished: bool,
    /// Paint order, the same on every replica; ties are broken by id
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Drawing {
    /// Freehand stroke started at `start` (pointer-down)
    pub fn stroke(
        session_id: SessionId,
        user_id: UserId,
        tool: DrawingTool,
        color: impl Into<String>,
        stroke_width: f32,
        start: DrawingPoint,
    ) -> Self {
        Self {
            id: DrawingId::new(),
            session_id,
            user_id,
            tool,
            color: color.into(),
            stroke_width,
            points: vec![start],
            shape: None,
            text: None,
            finished: false,
            seq: 0,
            created_at: Utc::now(),
        }
    }

    /// Shape spanning `from`..`to`, finished on creation
    pub fn shape(
        session_id: SessionId,
        user_id: UserId,
        shape: ShapeKind,
        color: impl Into<String>,
        stroke_width: f32,
        from: DrawingPoint,
        to: DrawingPoint,
    ) -> Self {
        Self {
            tool: DrawingTool::Shape,
            points: vec![from, to],
            shape: Some(shape),
            finished: true,
            ..Self::stroke(session_id, user_id, DrawingTool::Shape, color, stroke_width, from)
        }
    }

    /// Text label anchored at `at`; `stroke_width` doubles as font size
    pub fn text(
        session_id: SessionId,
        user_id: UserId,
        text: impl Into<String>,
        color: impl Into<String>,
        font_size: f32,
        at: DrawingPoint,
    ) -> Self {
        Self {
            text: Some(text.into()),
            finished: true,
            ..Self::stroke(session_id, user_id, DrawingTool::Text, color, font_size, at)
        }
    }

    /// Sort key for paint order
    pub fn paint_key(&self) -> (u64, DrawingId) {
        (self.seq, self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.stroke_width.is_finite() && self.stroke_width > 0.0) {
            return Err(SessionError::InvalidOp(format!(
                "stroke width must be positive, got {}",
                self.stroke_width
            )));
        }
        if self.points.is_empty() {
            return Err(SessionError::InvalidOp("drawing has no points".to_string()));
        }
        if let Some(point) = self.points.iter().find(|p| !p.is_finite()) {
            return Err(SessionError::InvalidOp(format!(
                "non-finite point ({}, {})",
                point.x, point.y
            )));
        }
        match self.tool {
            DrawingTool::Shape if self.shape.is_none() || self.points.len() < 2 => Err(
                SessionError::InvalidOp("shapes need a kind and two points".to_string()),
            ),
            DrawingTool::Text
                if self
                    .text
                    .as_deref()
                    .map(|t| t.trim().is_empty())
                    .unwrap_or(true) =>
            {
                Err(SessionError::InvalidOp("text drawings need content".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn paint_style(&self) -> PaintStyle {
        let (alpha, glow, composite) = match self.tool {
            DrawingTool::Pen | DrawingTool::Shape | DrawingTool::Text => {
                (1.0, 0.0, CompositeMode::SourceOver)
            }
            DrawingTool::Highlighter => (0.35, self.stroke_width * 2.0, CompositeMode::SourceOver),
            DrawingTool::Eraser => (1.0, 0.0, CompositeMode::DestinationOut),
        };

        PaintStyle {
            color: self.color.clone(),
            width: self.stroke_width,
            alpha,
            glow,
            composite,
        }
    }

    /// Axis-aligned bounds as (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> Option<(f32, f32, f32, f32)> {
        let first = self.points.first()?;
        Some(self.points.iter().fold(
            (first.x, first.y, first.x, first.y),
            |(min_x, min_y, max_x, max_y), p| {
                (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
            },
        ))
    }
}

/// Replicated whiteboard change, applied identically by server and clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WhiteboardEvent {
    StrokeStarted {
        drawing: Drawing,
    },
    StrokeExtended {
        user_id: UserId,
        drawing_id: DrawingId,
        points: Vec<DrawingPoint>,
    },
    StrokeFinished {
        user_id: UserId,
        drawing_id: DrawingId,
    },
    /// The author took `drawing_id` back
    Undone {
        user_id: UserId,
        drawing_id: DrawingId,
    },
    /// The author put an undone drawing back; carries the whole drawing
    Redone {
        user_id: UserId,
        drawing: Drawing,
    },
    Cleared {
        user_id: UserId,
    },
}

impl WhiteboardEvent {
    pub fn user_id(&self) -> UserId {
        match self {
            WhiteboardEvent::StrokeStarted { drawing } => drawing.user_id,
            WhiteboardEvent::StrokeExtended { user_id, .. }
            | WhiteboardEvent::StrokeFinished { user_id, .. }
            | WhiteboardEvent::Undone { user_id, .. }
            | WhiteboardEvent::Redone { user_id, .. }
            | WhiteboardEvent::Cleared { user_id } => *user_id,
        }
    }

    /// Rewrite the acting user, used by the server to ignore client-claimed ids
    pub fn with_user(mut self, actor: UserId) -> Self {
        match &mut self {
            WhiteboardEvent::StrokeStarted { drawing } => drawing.user_id = actor,
            WhiteboardEvent::Redone { user_id, drawing } => {
                *user_id = actor;
                drawing.user_id = actor;
            }
            WhiteboardEvent::StrokeExtended { user_id, .. }
            | WhiteboardEvent::StrokeFinished { user_id, .. }
            | WhiteboardEvent::Undone { user_id, .. }
            | WhiteboardEvent::Cleared { user_id } => *user_id = actor,
        }
        self
    }
}
