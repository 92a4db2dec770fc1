//! Code generation for the worker RPC surface.
//!
//! Normally this would be `tonic_build::compile_protos("proto/worker.proto")`,
//! which shells out to the `protoc` binary to parse the `.proto` into a
//! `FileDescriptorSet`. In environments without `protoc` installed, that step
//! fails. To stay self-contained we build the descriptor set in-process from
//! `proto/worker.proto` and hand it to tonic's `compile_fds`, which performs
//! exactly the same code generation. The generated Rust is identical either
//! way.

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(camel_case(name)),
        ..Default::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn method(name: &str, input: &str, output: &str) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".worker.{input}")),
        output_type: Some(format!(".worker.{output}")),
        ..Default::default()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/worker.proto");

    let file = FileDescriptorProto {
        name: Some("worker.proto".to_string()),
        package: Some("worker".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            message("TimeRequest", vec![]),
            message(
                "TimeResponse",
                vec![field("server_time_ms", 1, Type::Int64)],
            ),
            message(
                "StoreModelWeightsRequest",
                vec![
                    field("model_state", 1, Type::Bytes),
                    field("model_id", 2, Type::String),
                ],
            ),
            message(
                "StoreModelWeightsResponse",
                vec![
                    field("success", 1, Type::Bool),
                    field("error_message", 2, Type::String),
                    field("model_id", 3, Type::String),
                ],
            ),
            message(
                "ForwardPassRequest",
                vec![
                    field("input_data", 1, Type::Bytes),
                    field("model_index", 2, Type::Uint32),
                ],
            ),
            message(
                "ForwardPassResponse",
                vec![
                    field("success", 1, Type::Bool),
                    field("error_message", 2, Type::String),
                    field("output", 3, Type::Bytes),
                ],
            ),
            message(
                "GradientRequest",
                vec![
                    field("model_state", 1, Type::Bytes),
                    field("input_data", 2, Type::Bytes),
                    field("target_data", 3, Type::Bytes),
                    field("model_type", 4, Type::String),
                    field("criterion_type", 5, Type::String),
                ],
            ),
            message(
                "GradientResponse",
                vec![
                    field("gradients", 1, Type::Bytes),
                    field("loss", 2, Type::Float),
                    field("success", 3, Type::Bool),
                    field("error_message", 4, Type::String),
                ],
            ),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("Executor".to_string()),
            method: vec![
                method("GetServerTime", "TimeRequest", "TimeResponse"),
                method(
                    "StoreModelWeights",
                    "StoreModelWeightsRequest",
                    "StoreModelWeightsResponse",
                ),
                method("ForwardPass", "ForwardPassRequest", "ForwardPassResponse"),
                method("GetGradients", "GradientRequest", "GradientResponse"),
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let fds = FileDescriptorSet { file: vec![file] };
    tonic_build::compile_fds(fds)?;
    Ok(())
}
