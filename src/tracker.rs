use crate::FrameResult;

/// Decides when a frame shows a plate worth saving: a captured reading whose plate
/// differs from the last one saved.
#[derive(Debug, Default)]
pub struct NewPlateFilter {
    last_plate: Option<String>,
}

impl NewPlateFilter {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_plate(&self) -> Option<&str> {
        self.last_plate.as_deref()
    }

    pub fn observe(&mut self, frame: &FrameResult) -> Option<String> {
        frame.captured.as_ref()?;
        let plate = frame.primary_plate()?;
        if self.last_plate.as_deref() == Some(plate) {
            return None;
        }
        self.last_plate = Some(plate.to_string());
        self.last_plate.clone()
    }
}
