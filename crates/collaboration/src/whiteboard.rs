/// Replicated whiteboard surface
///
/// Every replica keeps drawings sorted by their paint order `(seq, id)`, so a
/// late joiner rebuilt from a snapshot paints the same picture and a redo
/// puts a drawing back exactly where it was. Undo and redo are per user: a
/// participant can only take back their own drawings. Undo and redo events
/// name the drawing they touch, so replicas without the author's history
/// still apply them.
use std::collections::HashMap;
use tracing::debug;

use session::Result;

use crate::{
    Drawing, DrawingId, DrawingPoint, DrawingTool, PaintStyle, SessionError, SessionId, ShapeKind,
    UserId, WhiteboardEvent,
};

/// Rendering target for [`WhiteboardSurface::render`]
pub trait Canvas {
    fn clear(&mut self);
    fn stroke_path(&mut self, points: &[DrawingPoint], style: &PaintStyle);
    fn draw_shape(&mut self, shape: ShapeKind, from: DrawingPoint, to: DrawingPoint, style: &PaintStyle);
    fn draw_text(&mut self, text: &str, at: DrawingPoint, style: &PaintStyle);
}

#[derive(Debug, Clone, Default)]
struct DrawingHistory {
    undo_stack: Vec<DrawingId>,
    redo_stack: Vec<Drawing>,
}

#[derive(Debug, Clone)]
pub struct WhiteboardSurface {
    session_id: SessionId,
    drawings: Vec<Drawing>,
    next_seq: u64,
    active: HashMap<UserId, DrawingId>,
    history: HashMap<UserId, DrawingHistory>,
}

impl WhiteboardSurface {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            drawings: Vec::new(),
            next_seq: 0,
            active: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// Rebuild a replica from a snapshot; each drawing lands on its author's undo stack
    pub fn from_drawings(session_id: SessionId, drawings: Vec<Drawing>) -> Result<Self> {
        let mut surface = Self::new(session_id);
        for drawing in drawings {
            surface.insert_new(drawing)?;
        }
        Ok(surface)
    }

    /// Drawings in paint order
    pub fn drawings(&self) -> impl Iterator<Item = &Drawing> {
        self.drawings.iter()
    }

    pub fn len(&self) -> usize {
        self.drawings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawings.is_empty()
    }

    pub fn get(&self, id: DrawingId) -> Option<&Drawing> {
        self.drawings.iter().find(|d| d.id == id)
    }

    pub fn active_stroke(&self, user_id: UserId) -> Option<&Drawing> {
        self.active.get(&user_id).and_then(|id| self.get(*id))
    }

    pub fn can_undo(&self, user_id: UserId) -> bool {
        self.history
            .get(&user_id)
            .map(|h| !h.undo_stack.is_empty())
            .unwrap_or(false)
    }

    pub fn can_redo(&self, user_id: UserId) -> bool {
        self.history
            .get(&user_id)
            .map(|h| !h.redo_stack.is_empty())
            .unwrap_or(false)
    }

    /// Pointer-down
    pub fn begin_stroke(
        &mut self,
        user_id: UserId,
        tool: DrawingTool,
        color: impl Into<String>,
        width: f32,
        start: DrawingPoint,
    ) -> Result<WhiteboardEvent> {
        if matches!(tool, DrawingTool::Shape | DrawingTool::Text) {
            return Err(SessionError::InvalidOp(format!(
                "{:?} is not a freehand tool",
                tool
            )));
        }
        let drawing = Drawing::stroke(self.session_id, user_id, tool, color, width, start);
        self.emit_new(drawing)
    }

    /// Pointer-move
    pub fn extend_stroke(
        &mut self,
        user_id: UserId,
        points: Vec<DrawingPoint>,
    ) -> Result<WhiteboardEvent> {
        let drawing_id = self.active_id(user_id)?;
        self.emit(WhiteboardEvent::StrokeExtended {
            user_id,
            drawing_id,
            points,
        })
    }

    /// Pointer-up
    pub fn finish_stroke(&mut self, user_id: UserId) -> Result<WhiteboardEvent> {
        let drawing_id = self.active_id(user_id)?;
        self.emit(WhiteboardEvent::StrokeFinished {
            user_id,
            drawing_id,
        })
    }

    pub fn add_shape(
        &mut self,
        user_id: UserId,
        shape: ShapeKind,
        color: impl Into<String>,
        width: f32,
        from: DrawingPoint,
        to: DrawingPoint,
    ) -> Result<WhiteboardEvent> {
        let drawing = Drawing::shape(self.session_id, user_id, shape, color, width, from, to);
        self.emit_new(drawing)
    }

    pub fn add_text(
        &mut self,
        user_id: UserId,
        text: impl Into<String>,
        color: impl Into<String>,
        font_size: f32,
        at: DrawingPoint,
    ) -> Result<WhiteboardEvent> {
        let drawing = Drawing::text(self.session_id, user_id, text, color, font_size, at);
        self.emit_new(drawing)
    }

    /// Take back the user's most recent drawing
    pub fn undo(&mut self, user_id: UserId) -> Result<WhiteboardEvent> {
        let drawing_id = self
            .history
            .get(&user_id)
            .and_then(|h| h.undo_stack.last().copied())
            .ok_or(SessionError::HistoryEmpty("undo stack"))?;
        self.emit(WhiteboardEvent::Undone {
            user_id,
            drawing_id,
        })
    }

    /// Put back the user's most recently undone drawing
    pub fn redo(&mut self, user_id: UserId) -> Result<WhiteboardEvent> {
        let drawing = self
            .history
            .get(&user_id)
            .and_then(|h| h.redo_stack.last().cloned())
            .ok_or(SessionError::HistoryEmpty("redo stack"))?;
        self.emit(WhiteboardEvent::Redone { user_id, drawing })
    }

    pub fn clear(&mut self, user_id: UserId) -> Result<WhiteboardEvent> {
        self.emit(WhiteboardEvent::Cleared { user_id })
    }

    /// Apply an event produced here or by a remote replica
    pub fn apply(&mut self, event: &WhiteboardEvent) -> Result<()> {
        match event {
            WhiteboardEvent::StrokeStarted { drawing } => self.insert_new(drawing.clone()),
            WhiteboardEvent::StrokeExtended {
                user_id,
                drawing_id,
                points,
            } => {
                if self.active.get(user_id) != Some(drawing_id) {
                    return Err(SessionError::DrawingNotFound(*drawing_id));
                }
                if points.iter().any(|p| !p.is_finite()) {
                    return Err(SessionError::InvalidOp("non-finite point".to_string()));
                }
                let drawing = self.drawing_mut(*drawing_id)?;
                drawing.points.extend_from_slice(points);
                Ok(())
            }
            WhiteboardEvent::StrokeFinished {
                user_id,
                drawing_id,
            } => {
                if self.active.get(user_id) != Some(drawing_id) {
                    return Err(SessionError::DrawingNotFound(*drawing_id));
                }
                self.active.remove(user_id);
                self.drawing_mut(*drawing_id)?.finished = true;
                Ok(())
            }
            WhiteboardEvent::Undone {
                user_id,
                drawing_id,
            } => self.remove_undone(*user_id, *drawing_id),
            WhiteboardEvent::Redone { user_id, drawing } => {
                self.restore_redone(*user_id, drawing.clone())
            }
            WhiteboardEvent::Cleared { user_id } => {
                debug!(
                    "Whiteboard {} cleared by {} ({} drawings)",
                    self.session_id,
                    user_id,
                    self.drawings.len()
                );
                self.drawings.clear();
                self.active.clear();
                self.history.clear();
                Ok(())
            }
        }
    }

    /// Clear the canvas and replay every drawing in paint order
    pub fn render(&self, canvas: &mut dyn Canvas) {
        canvas.clear();
        for drawing in &self.drawings {
            let style = drawing.paint_style();
            match (drawing.tool, drawing.shape, drawing.text.as_deref()) {
                (DrawingTool::Shape, Some(shape), _) if drawing.points.len() >= 2 => {
                    let from = drawing.points[0];
                    let to = drawing.points[drawing.points.len() - 1];
                    canvas.draw_shape(shape, from, to, &style);
                }
                (DrawingTool::Text, _, Some(text)) => {
                    canvas.draw_text(text, drawing.points[0], &style);
                }
                _ => canvas.stroke_path(&drawing.points, &style),
            }
        }
    }

    fn emit(&mut self, event: WhiteboardEvent) -> Result<WhiteboardEvent> {
        self.apply(&event)?;
        Ok(event)
    }

    /// Stamp a locally created drawing with the next paint position
    fn emit_new(&mut self, mut drawing: Drawing) -> Result<WhiteboardEvent> {
        drawing.seq = self.next_seq;
        self.emit(WhiteboardEvent::StrokeStarted { drawing })
    }

    fn active_id(&self, user_id: UserId) -> Result<DrawingId> {
        self.active
            .get(&user_id)
            .copied()
            .ok_or_else(|| SessionError::InvalidOp(format!("{} has no active stroke", user_id)))
    }

    fn drawing_mut(&mut self, id: DrawingId) -> Result<&mut Drawing> {
        self.drawings
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(SessionError::DrawingNotFound(id))
    }

    fn insert_new(&mut self, drawing: Drawing) -> Result<()> {
        let user_id = drawing.user_id;
        let drawing_id = drawing.id;
        let finished = drawing.finished;
        self.place(drawing)?;

        // a new pointer-down implicitly ends the previous stroke
        if let Some(previous) = self.active.remove(&user_id) {
            self.drawing_mut(previous)?.finished = true;
        }
        if !finished {
            self.active.insert(user_id, drawing_id);
        }

        let history = self.history.entry(user_id).or_default();
        history.undo_stack.push(drawing_id);
        history.redo_stack.clear();
        Ok(())
    }

    /// Validate and insert at the drawing's paint position
    fn place(&mut self, drawing: Drawing) -> Result<()> {
        drawing.validate()?;
        if drawing.session_id != self.session_id {
            return Err(SessionError::InvalidOp(
                "drawing belongs to another session".to_string(),
            ));
        }
        if self.get(drawing.id).is_some() {
            return Err(SessionError::InvalidOp(format!(
                "drawing {} already exists",
                drawing.id
            )));
        }

        self.next_seq = self.next_seq.max(drawing.seq.saturating_add(1));
        let key = drawing.paint_key();
        let index = self.drawings.partition_point(|d| d.paint_key() < key);
        self.drawings.insert(index, drawing);
        Ok(())
    }

    fn remove_undone(&mut self, user_id: UserId, drawing_id: DrawingId) -> Result<()> {
        let index = self
            .drawings
            .iter()
            .position(|d| d.id == drawing_id)
            .ok_or(SessionError::DrawingNotFound(drawing_id))?;
        if self.drawings[index].user_id != user_id {
            return Err(SessionError::PermissionDenied(
                "only the author may undo a drawing".to_string(),
            ));
        }

        let mut drawing = self.drawings.remove(index);
        if self.active.get(&user_id) == Some(&drawing_id) {
            self.active.remove(&user_id);
        }
        drawing.finished = true;

        let history = self.history.entry(user_id).or_default();
        history.undo_stack.retain(|id| *id != drawing_id);
        history.redo_stack.push(drawing);
        Ok(())
    }

    fn restore_redone(&mut self, user_id: UserId, mut drawing: Drawing) -> Result<()> {
        if drawing.user_id != user_id {
            return Err(SessionError::PermissionDenied(
                "only the author may redo a drawing".to_string(),
            ));
        }
        drawing.finished = true;
        let drawing_id = drawing.id;
        self.place(drawing)?;

        let history = self.history.entry(user_id).or_default();
        history.redo_stack.retain(|d| d.id != drawing_id);
        history.undo_stack.push(drawing_id);
        Ok(())
    }
}
