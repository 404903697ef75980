use std::process::Command;

use tfgraph::{
    GraphCodec, JsonCodec,
    ir::{DataType, FunctionBuilder, Program, ValueType},
};

fn program() -> Program {
    let f32 = ValueType::Tensor(DataType::Float);
    let mut b = FunctionBuilder::new("main");
    let gpu = b.int(0, DataType::Int64);
    b.tensor_op("tfc.configureGPU,enableInfeed", &[gpu], ValueType::Unit);
    let x = b.param(f32.clone());
    let y = b.tensor_op("Relu,$in", &[x], f32);
    b.ret(&[y]);
    Program::new(vec![b.finish()])
}

#[test]
fn test_lower_command_writes_graph() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("program.json");
    let output = dir.path().join("graph.json");
    std::fs::write(&input, serde_json::to_vec(&program()).unwrap()).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_tfgraph-cli"))
        .args(["lower", "--format", "json", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .env("TFGRAPH_ENTRY", "main")
        .status()
        .unwrap();
    assert!(status.success());

    let assembly = JsonCodec::default()
        .decode(&std::fs::read(&output).unwrap())
        .unwrap();
    assert_eq!(assembly.entry, "main");
    assert!(assembly.helpers.is_empty());
    let main = assembly.graph.function("main").unwrap();
    assert_eq!(main.nodes.len(), 1);
    assert_eq!(main.nodes[0].device, "/device:GPU:0");

    let listing = Command::new(env!("CARGO_BIN_EXE_tfgraph-cli"))
        .args(["inspect", "--format", "json", "--input"])
        .arg(&output)
        .output()
        .unwrap();
    assert!(listing.status.success());
    assert!(String::from_utf8_lossy(&listing.stdout).contains("Relu_"));
}

#[test]
fn test_lower_command_fails_on_unknown_entry() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("program.json");
    std::fs::write(&input, serde_json::to_vec(&program()).unwrap()).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_tfgraph-cli"))
        .args(["lower", "--entry", "nope", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.bin"))
        .status()
        .unwrap();
    assert!(!status.success());
}
