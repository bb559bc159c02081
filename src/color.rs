//! Loaded tool registry with height-banded replacements.
//!
//! Each slot holds a loaded tool and, while a replacement rule is active for
//! the current layer, the tool that should be emitted in its place.

/// Human labels of the default four-tool map palette.
const DEFAULT_LABELS: [&str; 4] = [
    "Base Color",
    "River Color",
    "Isoline Color",
    "High Elevation Color",
];

/// A single loaded tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSlot {
    pub index: usize,
    pub replacement: Option<usize>,
    pub label: String,
}

/// Registry of loaded tools, owned by one rewrite run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorTable {
    slots: Vec<ToolSlot>,
}

impl Default for ColorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorTable {
    /// The default four-tool palette.
    pub fn new() -> Self {
        Self::with_tools(DEFAULT_LABELS.len())
    }

    /// A table with `count` tools, labelled from the default palette where
    /// available.
    pub fn with_tools(count: usize) -> Self {
        let slots = (0..count)
            .map(|index| ToolSlot {
                index,
                replacement: None,
                label: DEFAULT_LABELS
                    .get(index)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("Tool {}", index)),
            })
            .collect();
        Self { slots }
    }

    /// Grow the table so that `index` has a slot.
    pub fn ensure_tool(&mut self, index: usize) {
        if index >= self.slots.len() {
            let grown = Self::with_tools(index + 1);
            self.slots.extend(grown.slots.into_iter().skip(self.slots.len()));
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&ToolSlot> {
        self.slots.get(index)
    }

    /// Current replacement for a tool, if one is active.
    pub fn replacement(&self, index: usize) -> Option<usize> {
        self.slots.get(index).and_then(|s| s.replacement)
    }

    pub fn set_replacement(&mut self, index: usize, replacement: usize) {
        self.ensure_tool(index);
        self.slots[index].replacement = Some(replacement);
    }

    pub fn clear_replacement(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.replacement = None;
        }
    }

    /// The tool that is actually emitted for nominal tool `index` right now.
    ///
    /// Indices outside the table are emitted unchanged.
    #[inline]
    pub fn printing_index(&self, index: usize) -> usize {
        self.replacement(index).unwrap_or(index)
    }
}
