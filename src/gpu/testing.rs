//! Recording fake backend for draw-count and ordering assertions.

use super::{BlendMode, DrawPass, LinkedProgram, ProgramSource, RenderBackend, SurfaceLoad};
use crate::error::EffectError;
use crate::frame::{QuadVertex, Surface};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub backend: String,
    pub program: String,
    pub blend: BlendMode,
    pub texture_size: (u32, u32),
    /// First texel of the bound image, as supplied by the caller.
    pub first_texel: [u8; 4],
    pub vertices: [QuadVertex; 4],
    pub flip_y: bool,
    pub load: SurfaceLoad,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Prepare { backend: String, program: String },
    Draw(DrawRecord),
}

/// Event log shared by any number of recording backends.
#[derive(Debug, Clone, Default)]
pub struct DrawLog(Arc<Mutex<Vec<Event>>>);

impl DrawLog {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn draws(&self) -> Vec<DrawRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Draw(record) => Some(record),
                Event::Prepare { .. } => None,
            })
            .collect()
    }

    pub fn draw_count(&self) -> usize {
        self.draws().len()
    }

    pub fn prepare_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Prepare { .. }))
            .count()
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

pub struct RecordingBackend {
    label: String,
    log: DrawLog,
    program: Option<(String, BlendMode)>,
    /// Remaining successful `prepare` calls; `None` never fails.
    prepares_left: Option<usize>,
}

impl RecordingBackend {
    pub fn new(label: &str) -> (Self, DrawLog) {
        let log = DrawLog::default();
        (Self::with_log(label, &log), log)
    }

    /// Records into an existing log so several backends share one timeline.
    pub fn with_log(label: &str, log: &DrawLog) -> Self {
        Self {
            label: label.to_string(),
            log: log.clone(),
            program: None,
            prepares_left: None,
        }
    }

    /// Lets `n` calls to `prepare` succeed, then fails every later one like
    /// a lost device.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.prepares_left = Some(n);
        self
    }
}

impl RenderBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn prepare(
        &mut self,
        source: &ProgramSource,
        _program: &LinkedProgram,
        blend: BlendMode,
        _width: u32,
        _height: u32,
    ) -> Result<(), EffectError> {
        match self.prepares_left.as_mut() {
            Some(0) => return Err(EffectError::ContextAcquisition("device lost".to_string())),
            Some(left) => *left -= 1,
            None => {}
        }
        self.program = Some((source.label.clone(), blend));
        self.log.push(Event::Prepare {
            backend: self.label.clone(),
            program: source.label.clone(),
        });
        Ok(())
    }

    fn draw(&mut self, pass: &DrawPass<'_>, _surface: &mut Surface) -> Result<(), EffectError> {
        let Some((program, blend)) = &self.program else {
            return Err(EffectError::Render("no program prepared".to_string()));
        };
        self.log.push(Event::Draw(DrawRecord {
            backend: self.label.clone(),
            program: program.clone(),
            blend: *blend,
            texture_size: (pass.image.width, pass.image.height),
            first_texel: pass.image.pixel(0, 0).unwrap_or([0, 0, 0, 0]),
            vertices: pass.vertices,
            flip_y: pass.flip_y,
            load: pass.load,
        }));
        Ok(())
    }
}
