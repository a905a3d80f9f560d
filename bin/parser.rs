/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parser for the textual program format, the same one `{:?}` prints:
//!
//! ```text
//! ; comment
//! config gfx10 wave=64 workgroup=256 wgp vgprs=40
//! pending_lds
//! pending_vmem v[0:1]
//! block 0 kind=top_level:
//!   v2 = buffer_load_dword s[0:3], v4, #0 storage=buffer
//! block 1 kind=loop_header preds=0,1 logical=0,1 depth=1:
//!   s_waitcnt vm=0
//!   v3 = v_add_f32 v2, v2
//! ```

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::iter::Peekable;
use std::path::PathBuf;
use std::str::CharIndices;

use waitcnt::{
  Block, BarrierInfo, Definition, DepctrWait, DsInfo, ExpInfo, FlatInfo,
  Format, GfxLevel, InstrKind, Instruction, MemorySyncInfo, Opcode, Operand,
  PhysReg, Program, ProgramConfig, SyncScope, WaitImm, WaitType,
  BLOCK_KIND_NAMES, SEMANTIC_NAMES, STORAGE_NAMES,
};

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse(String),
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

impl ToString for ParseError {
  fn to_string(&self) -> String {
    match self {
      ParseError::IoError(err) => format!("i/o error: {}", err),
      ParseError::Parse(msg) => msg.clone(),
    }
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_file(path: PathBuf) -> ParseResult<Program> {
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  parse_content(&content)
}

/// A `key=value` attribute or a bare flag, as found after the operands.
struct Attr {
  key: String,
  value: Option<String>,
}

struct Parser<'str> {
  iter: Peekable<CharIndices<'str>>,
  line: usize,
}

impl<'str> Parser<'str> {
  fn new(source: &'str str) -> Self {
    Self { iter: source.char_indices().peekable(), line: 1 }
  }

  // Characters.
  fn peek(&mut self) -> Option<char> {
    self.iter.peek().map(|(_, c)| *c)
  }

  fn advance(&mut self) -> Option<char> {
    let c = self.iter.next().map(|(_, c)| c);
    if c == Some('\n') {
      self.line += 1;
    }
    c
  }

  /// Skips spaces and a trailing comment, but not the end of the line.
  fn skip_spaces(&mut self) {
    while let Some(c) = self.peek() {
      if c == ' ' || c == '\t' || c == '\r' {
        self.advance();
      } else if c == ';' {
        while let Some(c) = self.peek() {
          if c == '\n' {
            break;
          }
          self.advance();
        }
      } else {
        break;
      }
    }
  }

  fn skip_whitespace_and_comments(&mut self) {
    loop {
      self.skip_spaces();
      if self.peek() == Some('\n') {
        self.advance();
      } else {
        break;
      }
    }
  }

  fn at_line_end(&mut self) -> bool {
    self.skip_spaces();
    matches!(self.peek(), None | Some('\n'))
  }

  fn is_done(&mut self) -> bool {
    self.skip_whitespace_and_comments();
    self.peek().is_none()
  }

  fn try_read_char(&mut self, expected: char) -> bool {
    self.skip_spaces();
    if self.peek() == Some(expected) {
      self.advance();
      true
    } else {
      false
    }
  }

  fn expect_char(&mut self, expected: char) -> ParseResult<()> {
    if self.try_read_char(expected) {
      Ok(())
    } else {
      self.error(&format!("expected char '{}'", expected))
    }
  }

  fn expect_line_end(&mut self) -> ParseResult<()> {
    if self.at_line_end() {
      Ok(())
    } else {
      self.error("unexpected trailing input")
    }
  }

  // Words.
  /// Reads a word on the current line.  Register ranges like `v[0:3]` are
  /// one word.
  fn try_read_word(&mut self) -> Option<String> {
    self.skip_spaces();
    let mut word = String::new();
    let mut in_brackets = false;
    while let Some(c) = self.peek() {
      let accept = is_word_char(c)
        || (c == '[' && !in_brackets)
        || (c == ']' && in_brackets)
        || (c == ':' && in_brackets);
      if !accept {
        break;
      }
      if c == '[' {
        in_brackets = true;
      } else if c == ']' {
        in_brackets = false;
      }
      word.push(c);
      self.advance();
    }
    if word.is_empty() {
      None
    } else {
      Some(word)
    }
  }

  fn read_word(&mut self) -> ParseResult<String> {
    match self.try_read_word() {
      Some(word) => Ok(word),
      None => self.error("expected a word"),
    }
  }

  fn read_int(&mut self) -> ParseResult<u32> {
    let word = self.read_word()?;
    self.parse_int(&word)
  }

  fn parse_int(&self, word: &str) -> ParseResult<u32> {
    let parsed = if let Some(hex) = word.strip_prefix("0x") {
      u32::from_str_radix(hex, 16)
    } else {
      word.parse::<u32>()
    };
    match parsed {
      Ok(value) => Ok(value),
      Err(_) => self.error(&format!("expected an integer, found '{}'", word)),
    }
  }

  fn parse_small<T: std::convert::TryFrom<u32>>(&self, word: &str) -> ParseResult<T> {
    let value = self.parse_int(word)?;
    match T::try_from(value) {
      Ok(value) => Ok(value),
      Err(_) => self.error(&format!("value {} out of range", value)),
    }
  }

  /// A comma-separated list of words, for attribute values.
  fn read_word_list(&mut self) -> ParseResult<String> {
    let mut list = self.read_word()?;
    while self.peek() == Some(',') {
      self.advance();
      list.push(',');
      list.push_str(&self.read_word()?);
    }
    Ok(list)
  }

  // Registers.
  fn parse_reg_range(&self, word: &str) -> ParseResult<(PhysReg, u8)> {
    if word == "exec" {
      return Ok((PhysReg::EXEC, 2));
    }
    let (is_vgpr, rest) = match word.as_bytes().first() {
      Some(b'v') => (true, &word[1..]),
      Some(b's') => (false, &word[1..]),
      _ => return self.error(&format!("expected a register, found '{}'", word)),
    };
    let (first, last) = if let Some(range) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
      let mut bounds = range.splitn(2, ':');
      let first = bounds.next().unwrap_or("");
      let last = bounds.next().unwrap_or(first);
      (self.parse_small::<u16>(first)?, self.parse_small::<u16>(last)?)
    } else {
      let n = self.parse_small::<u16>(rest)?;
      (n, n)
    };
    if last < first || last >= 256 || last - first >= 32 {
      return self.error(&format!("invalid register range '{}'", word));
    }
    let reg = if is_vgpr { PhysReg::vgpr(first) } else { PhysReg::sgpr(first) };
    Ok((reg, (last - first + 1) as u8))
  }

  fn parse_operand(&self, word: &str) -> ParseResult<Operand> {
    if word == "undef" {
      return Ok(Operand::Undefined);
    }
    if let Some(value) = word.strip_prefix('#') {
      return Ok(Operand::Constant(self.parse_int(value)?));
    }
    let (reg, size) = self.parse_reg_range(word)?;
    Ok(Operand::reg(reg, size))
  }

  // Attributes.
  fn parse_bits(&self, value: &str, names: &[&str]) -> ParseResult<u32> {
    let mut bits = 0;
    for name in value.split(',') {
      match names.iter().position(|n| *n == name) {
        Some(i) => bits |= 1 << i,
        None => return self.error(&format!("unknown name '{}'", name)),
      }
    }
    Ok(bits)
  }

  fn parse_scope(&self, value: &str) -> ParseResult<SyncScope> {
    match SyncScope::from_name(value) {
      Some(scope) => Ok(scope),
      None => self.error(&format!("unknown scope '{}'", value)),
    }
  }

  /// Consumes the attributes that make up memory synchronization info.
  fn take_sync(&self, attrs: &mut Vec<Attr>) -> ParseResult<MemorySyncInfo> {
    let mut sync = MemorySyncInfo::default();
    let mut rest = Vec::new();
    for attr in attrs.drain(..) {
      match (attr.key.as_str(), &attr.value) {
        ("storage", Some(value)) => sync.storage = self.parse_bits(value, &STORAGE_NAMES)? as u16,
        ("semantics", Some(value)) => {
          sync.semantics = self.parse_bits(value, &SEMANTIC_NAMES)? as u8
        }
        ("scope", Some(value)) => sync.scope = self.parse_scope(value)?,
        _ => rest.push(attr),
      }
    }
    *attrs = rest;
    Ok(sync)
  }

  fn take_flag(attrs: &mut Vec<Attr>, flag: &str) -> bool {
    match attrs.iter().position(|a| a.key == flag && a.value.is_none()) {
      Some(i) => {
        attrs.remove(i);
        true
      }
      None => false,
    }
  }

  fn take_value(attrs: &mut Vec<Attr>, key: &str) -> Option<String> {
    let i = attrs.iter().position(|a| a.key == key && a.value.is_some())?;
    attrs.remove(i).value
  }

  fn make_kind(&self, opcode: Opcode, attrs: &mut Vec<Attr>) -> ParseResult<InstrKind> {
    let kind = match opcode.format() {
      Format::Sop1 | Format::Sop2 => InstrKind::Salu,
      Format::Valu => InstrKind::Valu,
      Format::Sopp if opcode == Opcode::SWaitcnt => {
        let mut imm = WaitImm::new();
        for attr in attrs.drain(..) {
          let ty = match (WaitType::from_name(&attr.key), &attr.value) {
            (Some(ty), Some(_)) => ty,
            _ => return self.error(&format!("unknown counter '{}'", attr.key)),
          };
          imm[ty] = self.parse_small(attr.value.as_deref().unwrap_or(""))?;
        }
        InstrKind::Waitcnt(imm)
      }
      Format::Sopp if opcode == Opcode::SWaitcntDepctr => {
        let mut wait = DepctrWait::new();
        for attr in attrs.drain(..) {
          let value = self.parse_small(attr.value.as_deref().unwrap_or(""))?;
          if !wait.set_field(&attr.key, value) {
            return self.error(&format!("invalid dependency counter '{}'", attr.key));
          }
        }
        InstrKind::Depctr(wait)
      }
      Format::Sopp => {
        let imm = match Parser::take_value(attrs, "imm") {
          Some(value) => self.parse_small(&value)?,
          None => 0,
        };
        InstrKind::Sopp { imm }
      }
      Format::VinterpInreg => {
        let wait_exp = match Parser::take_value(attrs, "wait_exp") {
          Some(value) => self.parse_small(&value)?,
          None => 7,
        };
        InstrKind::VinterpInreg { wait_exp }
      }
      Format::Smem => InstrKind::Smem(self.take_sync(attrs)?),
      Format::LdsDir => InstrKind::LdsDir(self.take_sync(attrs)?),
      Format::Mubuf | Format::Mtbuf | Format::Mimg => InstrKind::Vmem(self.take_sync(attrs)?),
      Format::Ds => {
        let sync = self.take_sync(attrs)?;
        let gds = Parser::take_flag(attrs, "gds");
        let offset0 = match Parser::take_value(attrs, "offset0") {
          Some(value) => self.parse_small(&value)?,
          None => 0,
        };
        let offset1 = match Parser::take_value(attrs, "offset1") {
          Some(value) => self.parse_small(&value)?,
          None => 0,
        };
        InstrKind::Ds(DsInfo { sync, gds, offset0, offset1 })
      }
      Format::Flat | Format::Global | Format::Scratch => {
        let sync = self.take_sync(attrs)?;
        let may_use_lds = Parser::take_flag(attrs, "lds");
        InstrKind::Flat(FlatInfo { sync, may_use_lds })
      }
      Format::Exp => {
        let dest = match Parser::take_value(attrs, "dest") {
          Some(value) => self.parse_small(&value)?,
          None => return self.error("export without dest"),
        };
        let enabled_mask = match Parser::take_value(attrs, "en") {
          Some(value) => self.parse_small(&value)?,
          None => 0xf,
        };
        let compressed = Parser::take_flag(attrs, "compr");
        InstrKind::Exp(ExpInfo { dest, enabled_mask, compressed })
      }
      Format::PseudoBarrier => {
        let sync = self.take_sync(attrs)?;
        let exec_scope = match Parser::take_value(attrs, "exec_scope") {
          Some(value) => self.parse_scope(&value)?,
          None => SyncScope::Invocation,
        };
        InstrKind::Barrier(BarrierInfo { sync, exec_scope })
      }
    };
    if let Some(attr) = attrs.first() {
      return self.error(&format!("unexpected attribute '{}' for {}", attr.key, opcode.name()));
    }
    Ok(kind)
  }

  // Lines.
  fn read_instruction(&mut self, first: String) -> ParseResult<Instruction> {
    let mut definitions = Vec::new();
    let mut word = first;

    // Definitions are registers followed by ',' or '='.
    self.skip_spaces();
    if matches!(self.peek(), Some(',') | Some('=')) {
      loop {
        let (reg, size) = self.parse_reg_range(&word)?;
        definitions.push(Definition::new(reg, size));
        if self.try_read_char(',') {
          word = self.read_word()?;
          continue;
        }
        self.expect_char('=')?;
        break;
      }
      word = self.read_word()?;
    }

    let opcode = match Opcode::from_name(&word) {
      Some(opcode) => opcode,
      None => return self.error(&format!("unknown opcode '{}'", word)),
    };

    let mut operands = Vec::new();
    let mut attrs = Vec::new();
    while !self.at_line_end() {
      let word = self.read_word()?;
      if self.peek() == Some('=') {
        self.advance();
        let value = self.read_word_list()?;
        attrs.push(Attr { key: word, value: Some(value) });
      } else if !attrs.is_empty() || matches!(word.as_str(), "gds" | "lds" | "compr") {
        attrs.push(Attr { key: word, value: None });
      } else {
        operands.push(self.parse_operand(&word)?);
        self.try_read_char(',');
      }
    }

    let kind = self.make_kind(opcode, &mut attrs)?;
    Ok(Instruction::new(opcode, &definitions, &operands, kind))
  }

  fn read_config(&mut self) -> ParseResult<ProgramConfig> {
    let name = self.read_word()?;
    let gfx_level = match GfxLevel::from_name(&name) {
      Some(gfx_level) => gfx_level,
      None => return self.error(&format!("unknown hardware generation '{}'", name)),
    };
    let mut config = ProgramConfig::new(gfx_level);
    while !self.at_line_end() {
      let key = self.read_word()?;
      if key == "wgp" {
        config.wgp_mode = true;
        continue;
      }
      if key == "sram_ecc" {
        config.sram_ecc_enabled = true;
        continue;
      }
      self.expect_char('=')?;
      let value = self.read_int()?;
      match key.as_str() {
        "wave" => config.wave_size = value,
        "workgroup" => config.workgroup_size = value,
        "vgprs" => config.num_vgprs = value,
        "physical_vgprs" => config.physical_vgprs = value,
        "max_waves" => config.max_waves_per_simd = value,
        _ => return self.error(&format!("unknown config key '{}'", key)),
      }
    }
    if config.wave_size != 32 && config.wave_size != 64 {
      return self.error("wave size must be 32 or 64");
    }
    Ok(config)
  }

  fn read_preds(&mut self) -> ParseResult<Vec<u32>> {
    let mut preds = vec![self.read_int()?];
    while self.peek() == Some(',') {
      self.advance();
      preds.push(self.read_int()?);
    }
    Ok(preds)
  }

  fn read_block_header(&mut self, index: usize) -> ParseResult<Block> {
    let number = self.read_int()?;
    if number as usize != index {
      return self.error(&format!("expected block {}, found block {}", index, number));
    }
    let mut block = Block::new(number, 0);
    loop {
      if self.try_read_char(':') {
        break;
      }
      let key = self.read_word()?;
      self.expect_char('=')?;
      match key.as_str() {
        "kind" => {
          let value = self.read_word_list()?;
          block.kind = self.parse_bits(&value, &BLOCK_KIND_NAMES)? as u16;
        }
        "preds" => block.linear_preds = self.read_preds()?.into_iter().collect(),
        "logical" => block.logical_preds = self.read_preds()?.into_iter().collect(),
        "depth" => block.loop_nest_depth = self.read_int()?,
        _ => return self.error(&format!("unknown block attribute '{}'", key)),
      }
    }
    self.expect_line_end()?;
    Ok(block)
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse(format!("error at line {}: {}", self.line, msg)))
  }
}

pub fn parse_content(content: &str) -> ParseResult<Program> {
  let mut parser = Parser::new(content);
  let mut config = ProgramConfig::default();
  let mut pending_lds_access = false;
  let mut args_pending_vmem = Vec::new();
  let mut blocks: Vec<Block> = Vec::new();

  while !parser.is_done() {
    let word = parser.read_word()?;
    match word.as_str() {
      "config" if blocks.is_empty() => config = parser.read_config()?,
      "pending_lds" if blocks.is_empty() => pending_lds_access = true,
      "pending_vmem" if blocks.is_empty() => {
        let reg_word = parser.read_word()?;
        let (reg, size) = parser.parse_reg_range(&reg_word)?;
        args_pending_vmem.push(Definition::new(reg, size));
      }
      "block" => {
        let block = parser.read_block_header(blocks.len())?;
        blocks.push(block);
        continue;
      }
      _ => {
        let instr = parser.read_instruction(word)?;
        match blocks.last_mut() {
          Some(block) => block.instructions.push(instr),
          None => return parser.error("instruction outside of a block"),
        }
      }
    }
    parser.expect_line_end()?;
  }

  let mut program = Program::new(config);
  program.pending_lds_access = pending_lds_access;
  program.args_pending_vmem = args_pending_vmem;
  program.blocks = blocks;
  Ok(program)
}

fn is_word_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '#'
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "\
; two loads and a use
config gfx10.3 wave=32 workgroup=256 wgp vgprs=40
pending_vmem v[0:1]
block 0 kind=top_level:
  v2 = buffer_load_dword s[0:3], v4, #0 storage=buffer
  s[8:9] = s_load_dwordx2 s[2:3], #16
  exp v2, undef, undef, undef dest=12 en=0x1
  s_waitcnt vm=0 lgkm=1
  s_endpgm
block 1 kind=loop_header,top_level preds=0,1 logical=0 depth=1:
  v3 = v_interp_p10_f32_inreg v0, v1, v2 wait_exp=3
  ds_write_b32 v1, v2 storage=shared gds
  p_barrier storage=buffer,shared semantics=acquire,release scope=workgroup exec_scope=workgroup
";

  #[test]
  fn parses_sample() {
    let program = parse_content(SAMPLE).unwrap();
    assert_eq!(program.config.gfx_level, GfxLevel::Gfx10_3);
    assert_eq!(program.config.wave_size, 32);
    assert!(program.config.wgp_mode);
    assert_eq!(program.args_pending_vmem, vec![Definition::new(PhysReg::vgpr(0), 2)]);
    assert_eq!(program.blocks.len(), 2);

    let b0 = &program.blocks[0];
    assert_eq!(b0.instructions.len(), 5);
    assert_eq!(b0.instructions[0].opcode, Opcode::BufferLoadDword);
    assert_eq!(b0.instructions[0].operands[0], Operand::reg(PhysReg::sgpr(0), 4));
    let mut imm = WaitImm::single(WaitType::Vm, 0);
    imm[WaitType::Lgkm] = 1;
    assert_eq!(b0.instructions[3].kind, InstrKind::Waitcnt(imm));

    let b1 = &program.blocks[1];
    assert_eq!(b1.linear_preds.as_slice(), &[0, 1]);
    assert_eq!(b1.logical_preds.as_slice(), &[0]);
    assert_eq!(b1.loop_nest_depth, 1);
    assert_eq!(b1.instructions[0].kind, InstrKind::VinterpInreg { wait_exp: 3 });
    assert!(b1.instructions[1].ds_info().map_or(false, |ds| ds.gds));
  }

  #[test]
  fn printing_round_trips() {
    let program = parse_content(SAMPLE).unwrap();
    let printed = format!("{:?}", program);
    let reparsed = parse_content(&printed).unwrap();
    assert_eq!(program, reparsed);
  }

  #[test]
  fn reports_line_numbers() {
    let err = parse_content("block 0:\n  v0 = v_mov_b32 v1\n  v0 = v_frobnicate v1\n").unwrap_err();
    assert_eq!(err.to_string(), "error at line 3: unknown opcode 'v_frobnicate'");

    let err = parse_content("block 1:\n").unwrap_err();
    assert!(err.to_string().contains("expected block 0"));
  }
}
