//! End-to-end conversion tests: checkpoint file in, safetensors file out

use std::path::{Path, PathBuf};

use stconv_model::convert::layer_norm_rows;
use stconv_model::{
    convert_file, default_output_path, inspect_safetensors, load_checkpoint, save_safetensors,
    DType, GptNeoX, GptNeoXHparams, GptNeoXOptions, ModelError, Precision, Rwkv, RwkvHparams,
    RwkvOptions, Tensor, TensorMap, HPARAMS_KEY,
};

fn ramp(shape: Vec<usize>, scale: f32) -> Tensor {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|i| (i % 13) as f32 * scale - 1.0).collect();
    Tensor::from_f32(shape, &values).unwrap()
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn write_input(path: &Path, tensors: &TensorMap) {
    save_safetensors(path, tensors, None).unwrap();
}

fn neox_checkpoint() -> TensorMap {
    let (vocab, dim) = (96, 16);
    let mut tensors = TensorMap::new();
    tensors.insert("gpt_neox.embed_in.weight".into(), ramp(vec![vocab, dim], 0.1));
    for layer in 0..3 {
        let p = format!("gpt_neox.layers.{layer}");
        tensors.insert(format!("{p}.input_layernorm.weight"), ramp(vec![dim], 0.2));
        tensors.insert(format!("{p}.input_layernorm.bias"), ramp(vec![dim], 0.3));
        tensors.insert(format!("{p}.attention.query_key_value.weight"), ramp(vec![3 * dim, dim], 0.01));
        tensors.insert(format!("{p}.attention.dense.weight"), ramp(vec![dim, dim], 0.01));
        tensors.insert(
            format!("{p}.attention.bias"),
            Tensor::new(vec![1, 1, 4, 4], DType::Bool, vec![1; 16]).unwrap(),
        );
        tensors.insert(format!("{p}.attention.masked_bias"), ramp(vec![], 1.0));
        tensors.insert(format!("{p}.attention.rotary_emb.inv_freq"), ramp(vec![2], 1.0));
    }
    tensors.insert("gpt_neox.final_layer_norm.weight".into(), ramp(vec![dim], 0.5));
    tensors.insert("embed_out.weight".into(), ramp(vec![vocab, dim], 0.1));
    tensors
}

#[test]
fn test_gpt_neox_file_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("pythia-tiny.safetensors");
    write_input(&source, &neox_checkpoint());

    let output = dir.path().join("pythia-tiny-f16.safetensors");
    let arch = GptNeoX::new(GptNeoXOptions {
        precision: Precision::F16,
        ..Default::default()
    });
    let report = convert_file(&arch, &source, &output).unwrap();

    assert_eq!(report.output, output);
    assert!(report
        .tensors
        .iter()
        .all(|t| !t.name.ends_with(".masked_bias")
            && !t.name.ends_with("attention.bias")
            && !t.name.ends_with(".inv_freq")));

    // What was printed is what a reader sees
    let written = inspect_safetensors(&output).unwrap();
    assert_eq!(written.tensors, report.tensors);

    let metadata = written.metadata.unwrap();
    let hparams: GptNeoXHparams = serde_json::from_str(&metadata[HPARAMS_KEY]).unwrap();
    assert_eq!(hparams.vocab_size, 96);
    assert_eq!(hparams.embed_dim, 16);
    assert_eq!(hparams.num_layers, 3);

    let tensors = load_checkpoint(&output).unwrap();
    assert_eq!(tensors["embed_in.weight"].shape(), &[96, 16]);
    for (name, tensor) in &tensors {
        let expected = if tensor.ndim() > 1 { DType::F16 } else { DType::F32 };
        assert_eq!(tensor.dtype(), expected, "{name}");
    }
}

#[test]
fn test_rwkv_fold_file_conversion() {
    let (vocab, dim) = (32, 8);
    let mut input = TensorMap::new();
    input.insert("emb.weight".into(), ramp(vec![vocab, dim], 0.25));
    input.insert("blocks.0.ln0.weight".into(), ramp(vec![dim], 0.5));
    input.insert("blocks.0.ln0.bias".into(), ramp(vec![dim], 0.125));
    for layer in 0..2 {
        let p = format!("blocks.{layer}");
        input.insert(format!("{p}.ln1.weight"), ramp(vec![dim], 0.1));
        input.insert(format!("{p}.att.time_decay"), ramp(vec![dim], 0.1));
        input.insert(format!("{p}.att.time_mix_k"), ramp(vec![1, 1, dim], 0.1));
        input.insert(format!("{p}.att.key.weight"), ramp(vec![dim, dim], 0.1));
    }
    input.insert("head.weight".into(), ramp(vec![vocab, dim], 0.1));

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rwkv-tiny.pth.safetensors");
    write_input(&source, &input);

    let output = dir.path().join("rwkv-tiny-folded.safetensors");
    let arch = Rwkv::new(RwkvOptions {
        fold_ln0: true,
        ..Default::default()
    });
    let report = convert_file(&arch, &source, &output).unwrap();

    let written = inspect_safetensors(&output).unwrap();
    assert_eq!(written.tensors, report.tensors);
    assert!(written.tensors.iter().all(|t| !t.name.starts_with("blocks.0.ln0.")));

    let hparams: RwkvHparams =
        serde_json::from_str(&written.metadata.unwrap()[HPARAMS_KEY]).unwrap();
    assert_eq!(
        hparams,
        RwkvHparams {
            vocab_size: vocab,
            embed_dim: dim,
            num_layers: 2,
        }
    );

    let tensors = load_checkpoint(&output).unwrap();
    assert_eq!(tensors["blocks.1.att.time_mix_k"].shape(), &[dim]);
    assert!(tensors["blocks.0.att.time_decay"]
        .to_f32_vec()
        .iter()
        .all(|&w| w < 0.0));

    let expected = layer_norm_rows(
        "emb.weight",
        &input["emb.weight"],
        &input["blocks.0.ln0.weight"],
        &input["blocks.0.ln0.bias"],
        1e-5,
    )
    .unwrap();
    assert_eq!(tensors["emb.weight"], expected);
}

#[test]
fn test_default_output_next_to_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("RWKV-4-Pile-169M.pth");
    assert_eq!(
        default_output_path(&source),
        dir.path().join("RWKV-4-Pile-169M.safetensors")
    );
}

#[test]
fn test_missing_source() {
    let dir = tempfile::tempdir().unwrap();
    let err = convert_file(
        &Rwkv::default(),
        dir.path().join("absent.pth"),
        dir.path().join("absent.safetensors"),
    )
    .unwrap_err();
    assert!(matches!(err, ModelError::ModelNotFound(_)));
}

#[test]
fn test_gpt_neox_from_pytorch() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("pytorch_model.bin");
    std::fs::copy(fixture("gpt-neox-tiny.pth"), &source).unwrap();

    let arch = GptNeoX::new(GptNeoXOptions {
        precision: Precision::F16,
        ..Default::default()
    });
    let output = default_output_path(&source);
    let report = convert_file(&arch, &source, &output).unwrap();
    assert_eq!(output, dir.path().join("pytorch_model.safetensors"));

    let names: Vec<_> = report.tensors.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "embed_in.weight",
            "embed_out.weight",
            "final_layer_norm.weight",
            "layers.0.attention.dense.weight",
            "layers.0.attention.query_key_value.weight",
            "layers.0.input_layernorm.bias",
            "layers.0.input_layernorm.weight",
            "layers.1.attention.dense.weight",
            "layers.1.attention.query_key_value.weight",
            "layers.1.input_layernorm.bias",
            "layers.1.input_layernorm.weight",
        ]
    );

    let written = inspect_safetensors(&output).unwrap();
    assert_eq!(written.tensors, report.tensors);
    let hparams: GptNeoXHparams =
        serde_json::from_str(&written.metadata.unwrap()[HPARAMS_KEY]).unwrap();
    assert_eq!(
        hparams,
        GptNeoXHparams {
            vocab_size: 8,
            embed_dim: 4,
            num_layers: 2,
            num_heads: 8,
            num_rot: 2,
        }
    );

    let tensors = load_checkpoint(&output).unwrap();
    for (name, tensor) in &tensors {
        let expected = if tensor.ndim() > 1 { DType::F16 } else { DType::F32 };
        assert_eq!(tensor.dtype(), expected, "{name}");
    }

    let embed_in: Vec<f32> = (0..32).map(|k| (k as f32 - 16.0) / 8.0).collect();
    assert_eq!(tensors["embed_in.weight"].to_f32_vec(), embed_in);

    // embed_out is saved as a transposed view; the output is row-major
    let embed_out: Vec<f32> = (0..8)
        .flat_map(|row| (0..4).map(move |col| (row + 8 * col) as f32 / 32.0))
        .collect();
    assert_eq!(tensors["embed_out.weight"].shape(), &[8, 4]);
    assert_eq!(tensors["embed_out.weight"].to_f32_vec(), embed_out);
}

#[test]
fn test_rwkv_from_pytorch() {
    let input = load_checkpoint(fixture("rwkv-tiny.pth")).unwrap();
    assert!(input.values().all(|t| t.dtype() == DType::BF16));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("rwkv-tiny.safetensors");
    let arch = Rwkv::new(RwkvOptions {
        fold_ln0: true,
        ..Default::default()
    });
    let report = convert_file(&arch, fixture("rwkv-tiny.pth"), &output).unwrap();
    assert_eq!(report.tensors.len(), input.len() - 2);

    let written = inspect_safetensors(&output).unwrap();
    assert_eq!(written.tensors, report.tensors);
    let hparams: RwkvHparams =
        serde_json::from_str(&written.metadata.unwrap()[HPARAMS_KEY]).unwrap();
    assert_eq!(
        hparams,
        RwkvHparams {
            vocab_size: 6,
            embed_dim: 4,
            num_layers: 2,
        }
    );

    let tensors = load_checkpoint(&output).unwrap();
    assert!(!tensors.contains_key("blocks.0.ln0.weight"));
    assert!(!tensors.contains_key("blocks.0.ln0.bias"));
    assert!(tensors.values().all(|t| t.dtype() == DType::F32));
    assert_eq!(tensors["blocks.1.att.time_mix_k"].shape(), &[4]);
    assert_eq!(tensors["blocks.0.ffn.time_mix_r"].shape(), &[4]);

    let decay = input["blocks.0.att.time_decay"].map_f32(|w| -w.exp()).unwrap();
    assert_eq!(tensors["blocks.0.att.time_decay"], decay);

    let folded = layer_norm_rows(
        "emb.weight",
        &input["emb.weight"],
        &input["blocks.0.ln0.weight"],
        &input["blocks.0.ln0.bias"],
        1e-5,
    )
    .unwrap();
    assert_eq!(tensors["emb.weight"], folded);
}
