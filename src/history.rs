/// Visited remote directories.
///
/// Entries are only ever appended; going back or forward moves the position
/// without dropping anything, so forward entries survive a later visit.
#[derive(Debug, Clone, Default)]
pub struct NavigationHistory {
    entries: Vec<String>,
    position: Option<usize>,
}

impl NavigationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit; a repeat of the current entry is ignored.
    pub fn visit(&mut self, path: &str) {
        if self.current() == Some(path) {
            return;
        }
        self.entries.push(path.to_string());
        self.position = Some(self.entries.len() - 1);
    }

    pub fn current(&self) -> Option<&str> {
        self.position
            .and_then(|position| self.entries.get(position))
            .map(String::as_str)
    }

    pub fn peek_back(&self) -> Option<&str> {
        let position = self.position?.checked_sub(1)?;
        self.entries.get(position).map(String::as_str)
    }

    pub fn peek_forward(&self) -> Option<&str> {
        let position = self.position? + 1;
        self.entries.get(position).map(String::as_str)
    }

    /// Move one entry back, staying in bounds.
    pub fn back(&mut self) -> Option<&str> {
        let position = self.position?.checked_sub(1)?;
        self.position = Some(position);
        self.entries.get(position).map(String::as_str)
    }

    pub fn forward(&mut self) -> Option<&str> {
        let position = self.position? + 1;
        if position >= self.entries.len() {
            return None;
        }
        self.position = Some(position);
        self.entries.get(position).map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
