//! In-memory link that replays a script, for exercising codecs and the
//! communication loop without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::LinkDriver;
use crate::error::LinkError;

/// How long a read waits when the script has run dry
const DRY_READ_DELAY: Duration = Duration::from_millis(5);

enum Step {
    Data(Vec<u8>),
    Timeout,
}

type WriteHook = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    writes: Vec<Vec<u8>>,
    opens: u32,
    closes: u32,
    input_discards: u32,
    output_discards: u32,
    failing_opens: u32,
    on_write: Option<WriteHook>,
}

/// Test-side handle for feeding and inspecting a [`ScriptedLink`]
#[derive(Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes to be returned by subsequent reads
    pub fn push_data(&self, data: &[u8]) {
        self.lock().steps.push_back(Step::Data(data.to_vec()));
    }

    /// Queue a `\n`-terminated line
    pub fn push_line(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.lock().steps.push_back(Step::Data(data));
    }

    /// Queue one read timeout
    pub fn push_timeout(&self) {
        self.lock().steps.push_back(Step::Timeout);
    }

    /// Make the next `count` calls to `open` fail
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Run `hook` with every frame written to the link
    pub fn on_write(&self, hook: impl FnMut(&[u8]) + Send + 'static) {
        self.lock().on_write = Some(Box::new(hook));
    }

    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    #[must_use]
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    #[must_use]
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    #[must_use]
    pub fn input_discards(&self) -> u32 {
        self.lock().input_discards
    }

    #[must_use]
    pub fn output_discards(&self) -> u32 {
        self.lock().output_discards
    }

    /// Whether every queued step has been consumed
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.lock().steps.is_empty()
    }
}

/// Link driver backed by a script instead of hardware.
///
/// Discarding input does not drop scripted data, so a script can hold the
/// response to a query that the protocol sends after flushing its input.
pub struct ScriptedLink {
    name: String,
    open: bool,
    script: Arc<Mutex<Script>>,
}

impl ScriptedLink {
    /// Create a link and the handle that drives it
    pub fn new(name: impl Into<String>) -> (Self, ScriptHandle) {
        let script = Arc::new(Mutex::new(Script::default()));
        let handle = ScriptHandle {
            script: Arc::clone(&script),
        };
        (
            Self {
                name: name.into(),
                open: false,
                script,
            },
            handle,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LinkDriver for ScriptedLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), LinkError> {
        let mut script = self.lock();
        script.opens += 1;
        if script.failing_opens > 0 {
            script.failing_opens -= 1;
            return Err(LinkError::Open {
                port: self.name.clone(),
                message: "scripted open failure".to_string(),
            });
        }
        drop(script);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.lock().closes += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        let step = self.lock().steps.pop_front();
        match step {
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.lock().steps.push_front(Step::Data(rest));
                }
                Ok(n)
            }
            Some(Step::Timeout) => Err(LinkError::Timeout {
                expected: buf.len(),
                received: 0,
            }),
            None => {
                std::thread::sleep(DRY_READ_DELAY);
                Err(LinkError::Timeout {
                    expected: buf.len(),
                    received: 0,
                })
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        // Run the hook without the lock so it may use the handle
        let hook = {
            let mut script = self.lock();
            script.writes.push(data.to_vec());
            script.on_write.take()
        };
        if let Some(mut hook) = hook {
            hook(data);
            let mut script = self.lock();
            if script.on_write.is_none() {
                script.on_write = Some(hook);
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        self.lock().input_discards += 1;
        Ok(())
    }

    fn discard_output(&mut self) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        self.lock().output_discards += 1;
        Ok(())
    }
}
