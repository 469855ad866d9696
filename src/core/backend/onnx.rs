//! ONNX Runtime sessions for the native backend

use anyhow::{Context, Result};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Value;
use tracing::{debug, info, warn};

use super::BackendOptions;
use super::native::{AcousticSession, SessionLoader};
use crate::core::model::ModelDescriptor;

/// Loads acoustic models with ONNX Runtime
#[derive(Debug, Clone, Default)]
pub struct OnnxSessionLoader;

impl SessionLoader for OnnxSessionLoader {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &BackendOptions,
    ) -> Result<Box<dyn AcousticSession>> {
        info!("Loading acoustic model from: {:?}", descriptor.path());

        let mut builder =
            SessionBuilder::new()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        if let Some(num_threads) = options.num_threads {
            builder = builder
                .with_intra_threads(num_threads)?
                .with_inter_threads(1)?;
        }

        let session = builder
            .commit_from_file(descriptor.path())
            .with_context(|| format!("Failed to load {}", descriptor.path().display()))?;

        // Cache input/output names
        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();
        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        debug!("Acoustic model input names: {:?}", input_names);
        debug!("Acoustic model output names: {:?}", output_names);

        if output_names.is_empty() {
            anyhow::bail!("model declares no outputs");
        }

        Ok(Box::new(OnnxAcousticSession {
            session,
            input_names,
            output_names,
        }))
    }
}

struct OnnxAcousticSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl AcousticSession for OnnxAcousticSession {
    fn run(&mut self, tokens: &[i64], style: &[f32], speed: f32) -> Result<Vec<f32>> {
        // Token ids are padded with the boundary token 0 on both ends
        let mut padded = Vec::with_capacity(tokens.len() + 2);
        padded.push(0i64);
        padded.extend_from_slice(tokens);
        padded.push(0i64);

        let inputs: Vec<(&str, Value)> = self
            .input_names
            .iter()
            .filter_map(|name| {
                let value: Option<Value> = match name.as_str() {
                    "tokens" | "input_ids" => {
                        Value::from_array(([1usize, padded.len()], padded.clone()))
                            .ok()
                            .map(|v| v.into())
                    }
                    "style" | "ref_s" => Value::from_array(([1usize, style.len()], style.to_vec()))
                        .ok()
                        .map(|v| v.into()),
                    "speed" => {
                        let speed_shape: [usize; 1] = [1];
                        Value::from_array((speed_shape, vec![speed]))
                            .ok()
                            .map(|v| v.into())
                    }
                    other => {
                        warn!("Unknown acoustic model input name: {}", other);
                        None
                    }
                };
                value.map(|v| (name.as_str(), v))
            })
            .collect();

        let outputs = self.session.run(inputs)?;

        let (_shape, audio) = outputs
            .get(self.output_names[0].as_str())
            .context("No audio output from acoustic model")?
            .try_extract_tensor::<f32>()
            .context("Failed to extract audio tensor")?;

        Ok(audio.to_vec())
    }
}
