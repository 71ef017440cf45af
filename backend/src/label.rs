use crate::code_buffer::CodeBuffer;
use crate::EmitError;

/// A branch target within one block's host code.
///
/// Labels support forward references: branches may use a label
/// before it is bound, and the emitter back-patches them once the
/// label's offset is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Default)]
struct LabelState {
    /// Bound offset in the code buffer.
    value: Option<usize>,
    /// rel32 fields waiting for the label to be bound.
    uses: Vec<usize>,
}

/// Per-block label table.
#[derive(Debug, Default)]
pub struct Labels {
    labels: Vec<LabelState>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    pub fn create(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState::default());
        Label(id)
    }

    /// Bind `label` at `offset` and patch its pending uses.
    pub fn bind(&mut self, buf: &mut CodeBuffer, label: Label, offset: usize) {
        let state = &mut self.labels[label.0 as usize];
        state.value = Some(offset);
        for field in state.uses.drain(..) {
            buf.patch_u32(field, rel32(field, offset));
        }
    }

    /// Record a rel32 field at `field` that targets `label`,
    /// patching it right away if the label is already bound.
    pub fn add_use(&mut self, buf: &mut CodeBuffer, label: Label, field: usize) {
        let state = &mut self.labels[label.0 as usize];
        match state.value {
            Some(target) => buf.patch_u32(field, rel32(field, target)),
            None => state.uses.push(field),
        }
    }

    /// Fail if any label still has unresolved uses.
    pub fn check_resolved(&self) -> Result<(), EmitError> {
        match self
            .labels
            .iter()
            .position(|l| l.value.is_none() && !l.uses.is_empty())
        {
            Some(id) => Err(EmitError::UnboundLabel(id as u32)),
            None => Ok(()),
        }
    }
}

/// rel32 displacement from the end of the field at `field` to `target`.
#[inline]
fn rel32(field: usize, target: usize) -> u32 {
    (target as i64 - (field as i64 + 4)) as i32 as u32
}
