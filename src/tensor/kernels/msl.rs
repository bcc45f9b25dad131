//! Metal Shading Language sources for the elementwise kernels
//!
//! The entry point of every generated library carries the kernel name, so a
//! compiled library exposes exactly one function, `add_f32` for `add_f32`.

use super::{ElementwiseOp, KernelName};
use crate::dtype::{DType, DTypeKind};

fn scalar_type(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::F32 => Some("float"),
        DType::I32 => Some("int"),
        DType::I64 => Some("long"),
        _ => None,
    }
}

/// Buffer index of the `uint` element count, bound after the output.
pub fn count_index(kernel: &KernelName) -> usize {
    kernel.op.arity() + 1
}

/// Whether the kernel takes a fault flag at `count_index + 1`.
///
/// Integer division raises the flag on a zero divisor instead of producing
/// an undefined value.
pub fn reports_faults(kernel: &KernelName) -> bool {
    kernel.op == ElementwiseOp::Div && kernel.dtype.kind == DTypeKind::Int
}

/// Generate the MSL source for one kernel, or `None` for dtypes Metal
/// kernels are not generated for.
pub fn source(kernel: &KernelName) -> Option<String> {
    let ty = scalar_type(kernel.dtype)?;
    let name = kernel.to_string();

    let mut params: Vec<String> = ["a", "b"]
        .iter()
        .take(kernel.op.arity())
        .enumerate()
        .map(|(index, operand)| format!("device const {ty}* {operand} [[buffer({index})]]"))
        .collect();
    let count = count_index(kernel);
    params.push(format!("device {ty}* out [[buffer({})]]", count - 1));
    params.push(format!("constant uint& n [[buffer({count})]]"));
    if reports_faults(kernel) {
        params.push(format!("device atomic_uint* fault [[buffer({})]]", count + 1));
    }
    params.push("uint i [[thread_position_in_grid]]".to_string());

    let body = match kernel.op {
        ElementwiseOp::Neg => "out[i] = -a[i];".to_string(),
        ElementwiseOp::Div if reports_faults(kernel) => "if (b[i] == 0) {\n\
                 atomic_store_explicit(fault, 1u, memory_order_relaxed);\n\
                 out[i] = 0;\n\
                 return;\n\
             }\n\
             out[i] = a[i] / b[i];"
            .to_string(),
        op => {
            let symbol = match op {
                ElementwiseOp::Add => "+",
                ElementwiseOp::Sub => "-",
                ElementwiseOp::Mul => "*",
                ElementwiseOp::Div => "/",
                ElementwiseOp::Neg => unreachable!(),
            };
            format!("out[i] = a[i] {symbol} b[i];")
        }
    };

    Some(format!(
        "#include <metal_stdlib>\n\
         using namespace metal;\n\
         kernel void {name}({params}) {{\n\
             if (i >= n) return;\n\
             {body}\n\
         }}\n",
        params = params.join(",\n    "),
    ))
}
