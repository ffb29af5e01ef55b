//! Disassembly of generated stubs, for logging, debugger support and tests.

use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use indexmap::IndexMap;

/// Configure an [IntelFormatter] to match GDB's Intel syntax.
fn configure_gdb_intel_formatter(formatter: &mut IntelFormatter) {
    formatter
        .options_mut()
        .set_space_after_operand_separator(true);
    formatter.options_mut().set_hex_prefix("0x");
    formatter.options_mut().set_hex_suffix("");
    formatter.options_mut().set_uppercase_hex(false);
    formatter.options_mut().set_uppercase_keywords(false);
    formatter
        .options_mut()
        .set_space_between_memory_add_operators(true);
    formatter
        .options_mut()
        .set_space_between_memory_mul_operators(true);
    formatter
        .options_mut()
        .set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter.options_mut().set_rip_relative_addresses(true);
}

/// Render `buf` one instruction per line. Comment lines recorded at a byte
/// offset print above the instruction at that offset. `with_addrs` prefixes
/// each instruction with its absolute address and buffer offset.
pub(crate) fn render(
    buf: &ExecutableBuffer,
    comments: &IndexMap<usize, Vec<String>>,
    with_addrs: bool,
) -> String {
    if buf.len() == 0 {
        return String::new();
    }
    let code_ptr = buf.ptr(AssemblyOffset(0));
    let code = unsafe { std::slice::from_raw_parts(code_ptr, buf.len()) };
    let mut decoder = Decoder::with_ip(64, code, code_ptr as u64, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    configure_gdb_intel_formatter(&mut formatter);

    let mut lines = Vec::new();
    let mut instruction = Instruction::default();
    let mut output = String::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let off = usize::try_from(instruction.ip() - code_ptr as u64).unwrap();
        if let Some(cmts) = comments.get(&off) {
            for c in cmts {
                lines.push(format!("; {c}"));
            }
        }
        output.clear();
        formatter.format(&instruction, &mut output);
        if with_addrs {
            lines.push(format!("{:016x} {:08x}: {}", instruction.ip(), off, output));
        } else {
            lines.push(output.clone());
        }
    }
    lines.join("\n")
}

/// Disassemble an executable buffer into a vector of instruction strings.
#[cfg(test)]
pub(crate) fn disassemble(buf: &ExecutableBuffer) -> Vec<String> {
    render(buf, &IndexMap::new(), false)
        .lines()
        .map(|l| l.to_owned())
        .collect()
}

/// Verify that the actual instruction sequence matches the expected sequence.
#[cfg(test)]
pub(crate) fn verify_instruction_sequence(actual: &[String], expected: &[&str]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Instruction count mismatch. Expected {} instructions, got {}.\nActual: {:?}\nExpected: {:?}",
        expected.len(),
        actual.len(),
        actual,
        expected
    );

    for (i, (actual_inst, expected_inst)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(
            actual_inst, expected_inst,
            "Instruction {} mismatch.\nActual:   '{}'\nExpected: '{}'\nFull sequence:\nActual: {:?}\nExpected: {:?}",
            i, actual_inst, expected_inst, actual, expected
        );
    }
}
