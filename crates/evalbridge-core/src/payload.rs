//! Payload delivery strategies.
//!
//! Both strategies wrap code in an error trap so a thrown error stays on the
//! remote host: it is logged to the remote console and stored in
//! [`ProtocolConfig::ERROR_VAR`].
//!
//! - **Inline**: the wrapped code travels in an `eval` message.
//! - **Staged file**: the wrapped code is written to a timestamped file and
//!   only its path travels in an `eval-file` message. Code that renders a
//!   value additionally stores it in [`ProtocolConfig::RESULT_VAR`], since
//!   loading a file yields no completion value.

use crate::config::{BridgeConfig, DeliveryStrategy, ProtocolConfig};
use crate::protocol::OutboundMessage;
use crate::{BridgeError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Turns code into a wire request.
pub trait PayloadEncoder: Send + Sync {
    fn strategy(&self) -> DeliveryStrategy;

    fn encode_request(&self, code: &str) -> Result<OutboundMessage>;

    /// Release anything created while encoding.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Wrap `body` so a thrown error is reported remotely instead of escaping.
pub fn wrap_error_trap(body: &str) -> String {
    format!(
        "try {{\n{}\n}} catch (e) {{\nconsole.error(e);\n{} = e;\n}}",
        body,
        ProtocolConfig::ERROR_VAR
    )
}

/// True when `code` is a call to the value-rendering function.
pub fn is_rendered_expression(code: &str, render_signature: &str) -> bool {
    !render_signature.is_empty() && code.trim_start().starts_with(render_signature)
}

/// Code that initializes `namespace` on the remote host.
pub fn namespace_init_directive(namespace: &str) -> String {
    format!("evalbridge.runtime.initNamespace({:?});", namespace)
}

/// Code embedded directly in the message body.
#[derive(Debug, Default)]
pub struct InlineEncoder;

impl PayloadEncoder for InlineEncoder {
    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::Inline
    }

    fn encode_request(&self, code: &str) -> Result<OutboundMessage> {
        Ok(OutboundMessage::Eval {
            code: wrap_error_trap(code),
        })
    }
}

/// Code written to a file the remote host reads by path.
#[derive(Debug)]
pub struct StagedFileEncoder {
    dir: PathBuf,
    render_signature: String,
    staged: Mutex<Vec<PathBuf>>,
}

impl StagedFileEncoder {
    pub fn new(dir: impl Into<PathBuf>, render_signature: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            render_signature: render_signature.into(),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files written and not yet cleaned up.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        self.staged.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn body_for(&self, code: &str) -> String {
        if is_rendered_expression(code, &self.render_signature) {
            let expr = code.trim().trim_end_matches(';');
            format!("{} = {};", ProtocolConfig::RESULT_VAR, expr)
        } else {
            code.to_string()
        }
    }

    fn stage(&self, contents: &str) -> Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}{}-", ProtocolConfig::STAGED_FILE_PREFIX, timestamp))
            .suffix(ProtocolConfig::STAGED_FILE_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| BridgeError::io_with_path(e, &self.dir))?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;

        let (_, path) = file
            .keep()
            .map_err(|e| BridgeError::io_with_path(e.error, &self.dir))?;
        debug!("Staged payload at {}", path.display());

        self.staged
            .lock()
            .map_err(|_| BridgeError::poisoned("staged files"))?
            .push(path.clone());
        Ok(path)
    }
}

impl PayloadEncoder for StagedFileEncoder {
    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::StagedFile
    }

    fn encode_request(&self, code: &str) -> Result<OutboundMessage> {
        let path = self.stage(&wrap_error_trap(&self.body_for(code)))?;
        Ok(OutboundMessage::EvalFile {
            file: path.to_string_lossy().into_owned(),
        })
    }

    fn cleanup(&self) -> Result<()> {
        let staged = std::mem::take(
            &mut *self
                .staged
                .lock()
                .map_err(|_| BridgeError::poisoned("staged files"))?,
        );
        for path in staged {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

/// Build the encoder selected by `config`.
pub fn encoder_for(config: &BridgeConfig) -> Box<dyn PayloadEncoder> {
    match config.delivery_strategy {
        DeliveryStrategy::Inline => Box::new(InlineEncoder),
        DeliveryStrategy::StagedFile => Box::new(StagedFileEncoder::new(
            config.staging_dir(),
            config.render_signature.clone(),
        )),
    }
}
