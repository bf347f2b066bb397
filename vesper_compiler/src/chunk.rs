//! Bytecode storage.
//!
//! Each function compiles into its own [`Chunk`]; when a function is
//! finished its chunk is appended to the process-wide [`CodeBlock`] and the
//! function object records the offsets at which its bytecode and constants
//! landed. Constants are addressed relative to the function's base, so one
//! flat pool hosts every function.

use vesper_core::Value;

/// One contiguous run of bytecode attributed to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    /// First covered bytecode offset.
    pub start: usize,
    /// One past the last covered offset.
    pub end: usize,
    /// 0-based source line.
    pub line: u32,
    /// Index into the code block's file list.
    pub file: u16,
}

/// Per-function bytecode under construction.
#[derive(Debug, Default)]
pub struct Chunk {
    /// Instruction bytes.
    pub bytecode: Vec<u8>,
    /// Constant pool.
    pub constants: Vec<Value>,
    /// Line attribution, covering `bytecode` in order.
    pub lines: Vec<LineRange>,
}

impl Chunk {
    /// Empty chunk.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte attributed to `line` of `file`.
    pub fn write_byte(&mut self, byte: u8, line: u32, file: u16) {
        self.bytecode.push(byte);
        match self.lines.last_mut() {
            Some(last) if last.line == line && last.file == file => {
                last.end = self.bytecode.len();
            }
            _ => self.lines.push(LineRange {
                start: self.bytecode.len() - 1,
                end: self.bytecode.len(),
                line,
                file,
            }),
        }
    }

    /// Add a constant, returning its chunk-relative index.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }
}

/// The process-wide code block: one flat bytecode array, one flat constant
/// pool, and the line table covering both.
#[derive(Debug, Default)]
pub struct CodeBlock {
    /// All instruction bytes.
    pub bytecode: Vec<u8>,
    /// All constants.
    pub constants: Vec<Value>,
    /// Line attribution over `bytecode`.
    pub lines: Vec<LineRange>,
    /// Source file names, indexed by [`LineRange::file`].
    pub files: Vec<String>,
}

impl CodeBlock {
    /// Empty code block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished chunk, returning `(bytecode_offset, constants_offset)`.
    pub fn append(&mut self, chunk: Chunk) -> (usize, usize) {
        let bytecode_offset = self.bytecode.len();
        let constants_offset = self.constants.len();
        self.bytecode.extend_from_slice(&chunk.bytecode);
        self.constants.extend_from_slice(&chunk.constants);
        for mut range in chunk.lines {
            range.start += bytecode_offset;
            range.end += bytecode_offset;
            self.lines.push(range);
        }
        (bytecode_offset, constants_offset)
    }

    /// Line attribution for a bytecode offset, for stack traces.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> Option<LineRange> {
        self.lines
            .iter()
            .find(|range| range.start <= offset && offset < range.end)
            .copied()
    }

    /// File name for a line range.
    #[must_use]
    pub fn file_name(&self, range: LineRange) -> &str {
        self.files
            .get(range.file as usize)
            .map_or("<unknown>", |s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_byte_extends_line_runs() {
        let mut chunk = Chunk::new();
        chunk.write_byte(1, 0, 0);
        chunk.write_byte(2, 0, 0);
        chunk.write_byte(3, 1, 0);
        assert_eq!(chunk.lines.len(), 2);
        assert_eq!(chunk.lines[0].start, 0);
        assert_eq!(chunk.lines[0].end, 2);
        assert_eq!(chunk.lines[1].start, 2);
        assert_eq!(chunk.lines[1].end, 3);
    }

    #[test]
    fn append_offsets_lines_and_constants() {
        let mut block = CodeBlock::new();
        let mut a = Chunk::new();
        a.write_byte(10, 0, 0);
        a.add_constant(Value::int(1));
        block.append(a);

        let mut b = Chunk::new();
        b.write_byte(20, 5, 0);
        b.add_constant(Value::int(2));
        let (bc_off, const_off) = block.append(b);

        assert_eq!(bc_off, 1);
        assert_eq!(const_off, 1);
        assert_eq!(block.line_for(0).unwrap().line, 0);
        assert_eq!(block.line_for(1).unwrap().line, 5);
        assert_eq!(block.constants.len(), 2);
    }

    #[test]
    fn line_for_out_of_range_is_none() {
        let block = CodeBlock::new();
        assert!(block.line_for(0).is_none());
    }
}
