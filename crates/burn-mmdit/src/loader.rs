//! MMDiT weight loading from safetensors
//!
//! Reads checkpoints in the reference PyTorch layout:
//!
//! - `x_embedder.proj` (a `p×p` strided conv, permuted into a linear patch projection)
//! - `t_embedder.mlp.{0,2}`, `y_embedder.mlp.{0,2}` or `y_embedder.embedding_table`
//! - `context_embedder`, `register`, `pos_embed`, `context_pos_embed`
//! - `joint_blocks.{i}.{context_block,x_block}.{attn,adaLN_modulation.1,mlp}`
//! - `final_layer.{linear,adaLN_modulation.1}`
//!
//! Linear weights are stored `[out, in]` and transposed on load. Every
//! tensor is checked against the shape the configuration implies.

use std::path::Path;

use burn::module::Param;
use burn::nn::{Embedding, Linear};
use burn::prelude::*;
use burn_mmdit_convert::loader::SafeTensorFile;

use burn_mmdit_core::layernorm::LayerNorm;
use burn_mmdit_core::rmsnorm::RmsNorm;

use crate::attention::{HeadNorm, SelfAttention};
use crate::block::{FeedForward, StreamBlock};
use crate::config::{MmditConfig, PositionTableInit};
use crate::dropout::UnconditionalEmbeddings;
use crate::embedding::{ClassEmbedder, EmbedMlp};
use crate::error::MmditLoadError;
use crate::model::Mmdit;

/// Load an MMDiT from a safetensors checkpoint
///
/// # Arguments
///
/// * `path` - Path to the checkpoint
/// * `config` - Model configuration the checkpoint was trained with
/// * `uncond` - Unconditional substitutes for conditioning dropout
/// * `device` - Device to load onto
pub fn load_mmdit<B: Backend, P: AsRef<Path>>(
    path: P,
    config: &MmditConfig,
    uncond: Option<UnconditionalEmbeddings<B>>,
    device: &B::Device,
) -> Result<Mmdit<B>, MmditLoadError> {
    let path = path.as_ref();
    let file = SafeTensorFile::open(path)?;
    tracing::info!(path = %path.display(), tensors = file.len(), "loading mmdit checkpoint");

    let mut model = config.init(uncond, device)?;

    if file.shape("x_embedder.proj.weight").is_some_and(|shape| shape.len() == 4) {
        load_patch_conv(&file, config, &mut model.x_embedder.proj, device)?;
    } else {
        load_linear(&file, "x_embedder.proj", &mut model.x_embedder.proj, device)?;
    }
    load_embed_mlp(&file, "t_embedder.mlp", &mut model.t_embedder.mlp, device)?;
    match &mut model.y_embedder {
        ClassEmbedder::Label(label) => {
            load_embedding(&file, "y_embedder.embedding_table", &mut label.embedding_table, device)?
        }
        ClassEmbedder::Vector(vector) => {
            load_embed_mlp(&file, "y_embedder.mlp", &mut vector.mlp, device)?
        }
    }
    if let Some(context_embedder) = &mut model.context_embedder {
        load_linear(&file, "context_embedder", context_embedder, device)?;
    }
    if let Some(register) = &mut model.register {
        let expected = register.val().dims();
        *register = Param::from_tensor(tensor(&file, "register", expected, device)?);
    }

    let hidden = config.hidden_size();
    let m = config.pos_embed_max_size;
    if file.contains("pos_embed") || config.pos_embed_init == PositionTableInit::Zeros {
        let table = tensor(&file, "pos_embed", [1, m * m, hidden], device)?;
        model.pos_embed = model.pos_embed.with_table(table);
    }
    if file.contains("context_pos_embed") {
        let table = tensor(&file, "context_pos_embed", [1, config.context_len, hidden], device)?;
        model.pos_embed = model.pos_embed.with_context_table(table);
    }

    for (i, block) in model.joint_blocks.iter_mut().enumerate() {
        let prefix = format!("joint_blocks.{i}");
        load_stream(&file, &format!("{prefix}.context_block"), &mut block.context_block, device)?;
        load_stream(&file, &format!("{prefix}.x_block"), &mut block.x_block, device)?;
    }

    load_linear(&file, "final_layer.linear", &mut model.final_layer.linear, device)?;
    load_linear(
        &file,
        "final_layer.adaLN_modulation.1",
        &mut model.final_layer.ada_ln_modulation,
        device,
    )?;

    tracing::info!(params = model.num_params(), "mmdit checkpoint loaded");
    Ok(model)
}

impl<B: Backend> UnconditionalEmbeddings<B> {
    /// Reads the unconditional context and pooled vector
    ///
    /// Each file holds one tensor (or one named `context` / `pooled`).
    /// Context may be stored `[1, L, H]` or `[L, H]`; the pooled vector
    /// `[1, H]` or `[H]`.
    pub fn from_safetensors<P: AsRef<Path>, Q: AsRef<Path>>(
        context_path: P,
        pooled_path: Q,
        device: &B::Device,
    ) -> Result<Self, MmditLoadError> {
        let context_file = SafeTensorFile::open(context_path.as_ref())?;
        let pooled_file = SafeTensorFile::open(pooled_path.as_ref())?;

        let context: Tensor<B, 2> =
            context_file.load_f32_squeezed(&sole_tensor(&context_file, "context")?, device)?;
        let pooled: Tensor<B, 1> =
            pooled_file.load_f32_squeezed(&sole_tensor(&pooled_file, "pooled")?, device)?;

        tracing::info!(
            context = ?context.dims(),
            pooled = ?pooled.dims(),
            "loaded unconditional embeddings"
        );
        Ok(Self::new(context, pooled))
    }
}

fn sole_tensor(file: &SafeTensorFile, fallback: &str) -> Result<String, MmditLoadError> {
    if file.len() == 1 {
        if let Some(name) = file.names().next() {
            return Ok(name.to_string());
        }
    }
    if file.contains(fallback) {
        Ok(fallback.to_string())
    } else {
        Err(MmditLoadError::MissingTensor(fallback.to_string()))
    }
}

/// Reads `name`, requiring exactly the `expected` shape
fn tensor<B: Backend, const D: usize>(
    file: &SafeTensorFile,
    name: &str,
    expected: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>, MmditLoadError> {
    let actual = file
        .shape(name)
        .ok_or_else(|| MmditLoadError::MissingTensor(name.to_string()))?;
    if actual != expected.as_slice() {
        return Err(MmditLoadError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(file.load_f32(name, device)?)
}

fn load_linear<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    linear: &mut Linear<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    let [in_features, out_features] = linear.weight.val().dims();
    let weight: Tensor<B, 2> =
        tensor(file, &format!("{prefix}.weight"), [out_features, in_features], device)?;
    linear.weight = Param::from_tensor(weight.transpose());

    if linear.bias.is_some() {
        let bias = tensor(file, &format!("{prefix}.bias"), [out_features], device)?;
        linear.bias = Some(Param::from_tensor(bias));
    }
    Ok(())
}

/// Conv kernel `[hidden, C, p, p]` to a patch projection `[p * p * C, hidden]`
fn load_patch_conv<B: Backend>(
    file: &SafeTensorFile,
    config: &MmditConfig,
    proj: &mut Linear<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    let p = config.patch_size;
    let c = config.in_channels;
    let hidden = config.hidden_size();

    let kernel: Tensor<B, 4> = tensor(file, "x_embedder.proj.weight", [hidden, c, p, p], device)?;
    let weight = kernel.permute([2, 3, 1, 0]).reshape([p * p * c, hidden]);
    proj.weight = Param::from_tensor(weight);

    let bias = tensor(file, "x_embedder.proj.bias", [hidden], device)?;
    proj.bias = Some(Param::from_tensor(bias));
    Ok(())
}

fn load_embed_mlp<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    mlp: &mut EmbedMlp<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    load_linear(file, &format!("{prefix}.0"), &mut mlp.linear1, device)?;
    load_linear(file, &format!("{prefix}.2"), &mut mlp.linear2, device)
}

fn load_embedding<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    embedding: &mut Embedding<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    let expected = embedding.weight.val().dims();
    embedding.weight = Param::from_tensor(tensor(file, &format!("{prefix}.weight"), expected, device)?);
    Ok(())
}

fn load_head_norm<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    norm: &mut HeadNorm<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    match norm {
        HeadNorm::Rms(RmsNorm { weight: Some(weight), .. })
        | HeadNorm::Layer(LayerNorm { weight: Some(weight), bias: None, .. }) => {
            let expected = weight.val().dims();
            *weight = Param::from_tensor(tensor(file, &format!("{prefix}.weight"), expected, device)?);
        }
        HeadNorm::Layer(LayerNorm { weight: Some(weight), bias: Some(bias), .. }) => {
            let expected = weight.val().dims();
            *weight = Param::from_tensor(tensor(file, &format!("{prefix}.weight"), expected, device)?);
            *bias = Param::from_tensor(tensor(file, &format!("{prefix}.bias"), expected, device)?);
        }
        HeadNorm::Rms(_) | HeadNorm::Layer(_) => {}
    }
    Ok(())
}

fn load_attention<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    attn: &mut SelfAttention<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    load_linear(file, &format!("{prefix}.qkv"), &mut attn.qkv, device)?;
    if let Some(proj) = &mut attn.proj {
        load_linear(file, &format!("{prefix}.proj"), proj, device)?;
    }
    if let Some(ln_q) = &mut attn.ln_q {
        load_head_norm(file, &format!("{prefix}.ln_q"), ln_q, device)?;
    }
    if let Some(ln_k) = &mut attn.ln_k {
        load_head_norm(file, &format!("{prefix}.ln_k"), ln_k, device)?;
    }
    Ok(())
}

fn load_stream<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    stream: &mut StreamBlock<B>,
    device: &B::Device,
) -> Result<(), MmditLoadError> {
    load_attention(file, &format!("{prefix}.attn"), &mut stream.attn, device)?;
    load_linear(
        file,
        &format!("{prefix}.adaLN_modulation.1"),
        &mut stream.ada_ln_modulation,
        device,
    )?;

    match &mut stream.mlp {
        Some(FeedForward::Gelu(mlp)) => {
            load_linear(file, &format!("{prefix}.mlp.fc1"), &mut mlp.fc1, device)?;
            load_linear(file, &format!("{prefix}.mlp.fc2"), &mut mlp.fc2, device)?;
        }
        Some(FeedForward::SwiGlu(ffn)) => {
            load_linear(file, &format!("{prefix}.mlp.w1"), &mut ffn.gate_proj, device)?;
            load_linear(file, &format!("{prefix}.mlp.w3"), &mut ffn.up_proj, device)?;
            load_linear(file, &format!("{prefix}.mlp.w2"), &mut ffn.down_proj, device)?;
        }
        None => {}
    }
    Ok(())
}
