//! The line-oriented text format: assembler and disassembler.
//!
//! ```text
//! function add(int64, int64) -> (int64) {
//!   loadarg 0
//!   loadarg 1
//!   add
//!   ret
//! }
//! ```
//!
//! Instructions end at a newline, a `;`, or the closing brace, so whole
//! functions may be written on one line. `//` starts a comment. A label is
//! an identifier followed by `:` before a mnemonic; branches name labels
//! and calls name functions.

use std::collections::HashMap;
use std::io::{Read, Write};

use bytecode::{read_i32, read_i64, read_u16, read_u32, Assembler, InstIter, Op, Sys};
use memory::Handle;

use crate::error::{Error, FileError, ParseError, Position};
use crate::function::Function;
use crate::package::Package;
use crate::string::VmString;
use crate::types::{Type, TypeKind};
use crate::verify;

/// Parse text from `input`, build a fully materialized package, and attach
/// safepoint tables to every function that verifies. Functions that fail
/// verification keep an empty table so `validate` can report them.
pub fn read_package_asm(
    filename: &str,
    input: &mut dyn Read,
) -> Result<Package, Error> {
    let mut source = String::new();
    input.read_to_string(&mut source).map_err(|e| {
        FileError::new(filename, format!("cannot read: {e}"))
    })?;

    let mut tset = TokenSet::new(filename);
    let tokens = Lexer::new(&source, &mut tset).lex_file()?;
    let file = Parser::new(&source, &tset, &tokens).parse_file()?;
    let package = PackageBuilder::new(&source, &tset, filename).build(&file)?;

    for function in package.functions()? {
        if let Ok(safepoints) = verify::build_safepoints(&function, &package) {
            // SAFETY: the function block is live and exclusively ours until
            // the package escapes this call.
            unsafe {
                let f = &mut *(function.address() as *mut Function);
                let frame_size = safepoints.frame_size();
                f.set_safepoints(&safepoints);
                f.set_frame_size(frame_size);
            }
        }
    }
    Ok(package)
}

// ── lexing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    None,
    Newline,
    LParen,
    RParen,
    LBrace,
    RBrace,
    RArrow,
    Comma,
    Colon,
    Ident,
    Int,
}

impl TokenKind {
    fn name(self) -> &'static str {
        match self {
            TokenKind::None => "none",
            TokenKind::Newline => "newline",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::RArrow => "->",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Ident => "identifier",
            TokenKind::Int => "integer",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    begin: usize,
    end: usize,
}

/// Maps byte offsets to line/column positions for error reporting.
struct TokenSet {
    filename: String,
    lines: Vec<usize>,
}

impl TokenSet {
    fn new(filename: &str) -> TokenSet {
        TokenSet {
            filename: filename.to_string(),
            lines: vec![0],
        }
    }

    fn add_line(&mut self, offset: usize) {
        self.lines.push(offset);
    }

    fn position(&self, offset: usize) -> Position {
        let line = self.lines.partition_point(|&start| start <= offset);
        Position {
            filename: self.filename.clone(),
            line,
            column: offset - self.lines[line - 1] + 1,
        }
    }
}

struct Lexer<'a> {
    data: &'a [u8],
    tset: &'a mut TokenSet,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, tset: &'a mut TokenSet) -> Lexer<'a> {
        Lexer {
            data: source.as_bytes(),
            tset,
        }
    }

    fn error(&self, offset: usize, message: String) -> ParseError {
        ParseError::new(self.tset.position(offset), message)
    }

    fn lex_file(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < self.data.len() {
            let b = self.data[i];
            i += 1;
            match b {
                b' ' | b'\t' | b'\r' => {}
                b'\n' => {
                    self.tset.add_line(i);
                    // A newline ends an instruction only after an operand
                    // or mnemonic; elsewhere it is whitespace.
                    if let Some(prev) = tokens.last() {
                        if prev.kind == TokenKind::Ident
                            || prev.kind == TokenKind::Int
                        {
                            tokens.push(Token {
                                kind: TokenKind::Newline,
                                begin: i - 1,
                                end: i,
                            });
                        }
                    }
                }
                b';' => tokens.push(Token {
                    kind: TokenKind::Newline,
                    begin: i - 1,
                    end: i,
                }),
                b'(' => tokens.push(Token {
                    kind: TokenKind::LParen,
                    begin: i - 1,
                    end: i,
                }),
                b')' => tokens.push(Token {
                    kind: TokenKind::RParen,
                    begin: i - 1,
                    end: i,
                }),
                b'{' => tokens.push(Token {
                    kind: TokenKind::LBrace,
                    begin: i - 1,
                    end: i,
                }),
                b'}' => tokens.push(Token {
                    kind: TokenKind::RBrace,
                    begin: i - 1,
                    end: i,
                }),
                b',' => tokens.push(Token {
                    kind: TokenKind::Comma,
                    begin: i - 1,
                    end: i,
                }),
                b':' => tokens.push(Token {
                    kind: TokenKind::Colon,
                    begin: i - 1,
                    end: i,
                }),
                b'/' => {
                    if i < self.data.len() && self.data[i] == b'/' {
                        while i < self.data.len() && self.data[i] != b'\n' {
                            i += 1;
                        }
                    } else {
                        return Err(
                            self.error(i - 1, "unexpected character '/'".into())
                        );
                    }
                }
                _ => {
                    if b == b'-' && i < self.data.len() && self.data[i] == b'>'
                    {
                        i += 1;
                        tokens.push(Token {
                            kind: TokenKind::RArrow,
                            begin: i - 2,
                            end: i,
                        });
                        continue;
                    }
                    if is_ident_first(b) {
                        let begin = i - 1;
                        while i < self.data.len() && is_ident(self.data[i]) {
                            i += 1;
                        }
                        tokens.push(Token {
                            kind: TokenKind::Ident,
                            begin,
                            end: i,
                        });
                        continue;
                    }
                    // Integer, optionally signed.
                    let begin = i - 1;
                    let mut digit = b;
                    if b == b'-' || b == b'+' {
                        if i == self.data.len() {
                            return Err(self.error(
                                begin,
                                format!(
                                    "unexpected character '{}'; want digit",
                                    b as char
                                ),
                            ));
                        }
                        digit = self.data[i];
                        i += 1;
                    }
                    if !digit.is_ascii_digit() {
                        return Err(self.error(
                            begin,
                            format!(
                                "unexpected character '{}'; want digit",
                                digit as char
                            ),
                        ));
                    }
                    if digit == b'0'
                        && i < self.data.len()
                        && self.data[i].is_ascii_digit()
                    {
                        return Err(self.error(
                            begin,
                            "integer may not start with 0".into(),
                        ));
                    }
                    while i < self.data.len()
                        && self.data[i].is_ascii_digit()
                    {
                        i += 1;
                    }
                    tokens.push(Token {
                        kind: TokenKind::Int,
                        begin,
                        end: i,
                    });
                }
            }
        }
        Ok(tokens)
    }
}

fn is_ident_first(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    is_ident_first(b) || b.is_ascii_digit()
}

// ── parsing ────────────────────────────────────────────────────────

struct AsmInst {
    label: Option<Token>,
    mnemonic: Token,
    operands: Vec<Token>,
}

struct AsmFunction {
    name: Token,
    param_types: Vec<Token>,
    return_types: Vec<Token>,
    insts: Vec<AsmInst>,
}

struct AsmFile {
    functions: Vec<AsmFunction>,
}

struct Parser<'a> {
    data: &'a [u8],
    tset: &'a TokenSet,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(
        source: &'a str,
        tset: &'a TokenSet,
        tokens: &'a [Token],
    ) -> Parser<'a> {
        Parser {
            data: source.as_bytes(),
            tset,
            tokens,
            pos: 0,
        }
    }

    fn text(&self, token: Token) -> &'a str {
        // Token bounds always lie on ASCII boundaries.
        std::str::from_utf8(&self.data[token.begin..token.end])
            .expect("tokens are ASCII")
    }

    fn error(&self, offset: usize, message: String) -> ParseError {
        ParseError::new(self.tset.position(offset), message)
    }

    fn error_here(&self, message: String) -> ParseError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.data.len(), |t| t.begin);
        self.error(offset, message)
    }

    fn peek(&self) -> TokenKind {
        self.tokens.get(self.pos).map_or(TokenKind::None, |t| t.kind)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self.tokens.get(self.pos).copied().ok_or_else(|| {
            self.error(self.data.len(), "unexpected end of file".into())
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.next()?;
        if token.kind != kind {
            return Err(self.error(
                token.begin,
                format!(
                    "unexpected token '{}'; want {}",
                    self.text(token),
                    kind.name()
                ),
            ));
        }
        Ok(token)
    }

    fn expect_ident(&mut self, want: &str) -> Result<Token, ParseError> {
        let token = self.expect(TokenKind::Ident)?;
        if self.text(token) != want {
            return Err(self.error(
                token.begin,
                format!(
                    "unexpected token '{}'; want identifier {}",
                    self.text(token),
                    want
                ),
            ));
        }
        Ok(token)
    }

    fn parse_file(mut self) -> Result<AsmFile, ParseError> {
        let mut functions = Vec::new();
        while self.pos < self.tokens.len() {
            if self.peek() == TokenKind::Newline {
                self.pos += 1;
                continue;
            }
            functions.push(self.parse_function()?);
        }
        Ok(AsmFile { functions })
    }

    fn parse_function(&mut self) -> Result<AsmFunction, ParseError> {
        self.expect_ident("function")?;
        let name = self.expect(TokenKind::Ident)?;
        let param_types = self.parse_type_list()?;
        let mut return_types = Vec::new();
        if self.peek() == TokenKind::RArrow {
            self.pos += 1;
            return_types = self.parse_type_list()?;
        }
        let insts = self.parse_function_body()?;
        Ok(AsmFunction {
            name,
            param_types,
            return_types,
            insts,
        })
    }

    fn parse_type_list(&mut self) -> Result<Vec<Token>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut types = Vec::new();
        while self.peek() != TokenKind::RParen {
            if !types.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            types.push(self.expect(TokenKind::Ident)?);
        }
        self.pos += 1;
        Ok(types)
    }

    fn parse_function_body(&mut self) -> Result<Vec<AsmInst>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut insts = Vec::new();
        loop {
            match self.peek() {
                TokenKind::RBrace => {
                    self.pos += 1;
                    return Ok(insts);
                }
                TokenKind::Newline => {
                    self.pos += 1;
                }
                _ => insts.push(self.parse_inst()?),
            }
        }
    }

    fn parse_inst(&mut self) -> Result<AsmInst, ParseError> {
        let mut label = None;
        let mut mnemonic = self.expect(TokenKind::Ident)?;
        if self.peek() == TokenKind::Colon {
            label = Some(mnemonic);
            self.pos += 1;
            mnemonic = self.expect(TokenKind::Ident)?;
        }
        let mut operands = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Newline => {
                    self.pos += 1;
                    break;
                }
                // A brace closes the last instruction without a separator.
                TokenKind::RBrace => break,
                _ => {
                    if !operands.is_empty() {
                        self.expect(TokenKind::Comma)?;
                    }
                    match self.peek() {
                        TokenKind::Ident | TokenKind::Int => {
                            operands.push(self.next()?);
                        }
                        other => {
                            return Err(self.error_here(format!(
                                "unexpected token '{}'; want integer or \
                                 identifier",
                                other.name()
                            )));
                        }
                    }
                }
            }
        }
        Ok(AsmInst {
            label,
            mnemonic,
            operands,
        })
    }
}

// ── building ───────────────────────────────────────────────────────

struct PackageBuilder<'a> {
    data: &'a [u8],
    tset: &'a TokenSet,
    filename: &'a str,
    name_to_index: HashMap<&'a str, u32>,
}

struct LabelInfo {
    label: bytecode::Label,
    bound: bool,
    first_use: Option<Token>,
}

impl<'a> PackageBuilder<'a> {
    fn new(
        source: &'a str,
        tset: &'a TokenSet,
        filename: &'a str,
    ) -> PackageBuilder<'a> {
        PackageBuilder {
            data: source.as_bytes(),
            tset,
            filename,
            name_to_index: HashMap::new(),
        }
    }

    fn text(&self, token: Token) -> &'a str {
        std::str::from_utf8(&self.data[token.begin..token.end])
            .expect("tokens are ASCII")
    }

    fn error(&self, offset: usize, message: String) -> ParseError {
        ParseError::new(self.tset.position(offset), message)
    }

    fn build(mut self, file: &AsmFile) -> Result<Package, Error> {
        for (i, f) in file.functions.iter().enumerate() {
            let name = self.text(f.name);
            if self
                .name_to_index
                .insert(name, i as u32)
                .is_some()
            {
                return Err(self
                    .error(
                        f.name.begin,
                        format!("function {name} defined multiple times"),
                    )
                    .into());
            }
        }

        let mut functions = Vec::with_capacity(file.functions.len());
        for f in &file.functions {
            functions.push(self.build_function(f)?);
        }
        Ok(Package::from_functions(self.filename, functions))
    }

    fn build_function(
        &mut self,
        function: &AsmFunction,
    ) -> Result<Handle<Function>, Error> {
        let name = VmString::create(self.text(function.name))
            .map_err(Error::Alloc)?;
        let param_types = self.build_types(&function.param_types)?;
        let return_types = self.build_types(&function.return_types)?;

        let mut asm = Assembler::new();
        let mut labels: HashMap<&str, LabelInfo> = HashMap::new();

        for inst in &function.insts {
            if let Some(label_token) = inst.label {
                let label_name = self.text(label_token);
                let info = self.label_entry(&mut asm, &mut labels, label_name);
                if info.bound {
                    return Err(self
                        .error(
                            label_token.begin,
                            format!("label {label_name} bound multiple times"),
                        )
                        .into());
                }
                info.bound = true;
                let label = info.label;
                asm.bind(label);
            }
            self.build_inst(&mut asm, &mut labels, inst)?;
        }

        for (label_name, info) in &labels {
            if !info.bound {
                let use_token =
                    info.first_use.expect("unbound labels have a use");
                return Err(self
                    .error(
                        use_token.begin,
                        format!("use of unbound label '{label_name}'"),
                    )
                    .into());
            }
        }

        let insts = asm.finish().map_err(|e| {
            Error::Parse(self.error(function.name.begin, e.to_string()))
        })?;
        Function::create(&name, &param_types, &return_types, &insts, None, 0)
            .map_err(Error::Alloc)
    }

    fn label_entry<'b>(
        &self,
        asm: &mut Assembler,
        labels: &'b mut HashMap<&'a str, LabelInfo>,
        name: &'a str,
    ) -> &'b mut LabelInfo {
        labels.entry(name).or_insert_with(|| LabelInfo {
            label: asm.new_label(),
            bound: false,
            first_use: None,
        })
    }

    fn build_inst(
        &mut self,
        asm: &mut Assembler,
        labels: &mut HashMap<&'a str, LabelInfo>,
        inst: &AsmInst,
    ) -> Result<(), Error> {
        let m = self.text(inst.mnemonic);
        let want_operands = match m {
            "b" | "bif" | "call" | "int64" | "loadarg" | "loadlocal"
            | "storearg" | "storelocal" | "sys" => 1,
            _ => 0,
        };
        if inst.operands.len() != want_operands {
            return Err(self
                .error(
                    inst.mnemonic.begin,
                    format!(
                        "instruction {m} must have {want_operands} \
                         operand(s); got {}",
                        inst.operands.len()
                    ),
                )
                .into());
        }

        match m {
            "add" => asm.add(),
            "and" => asm.and_(),
            "asr" => asm.asr(),
            "b" | "bif" => {
                let token = inst.operands[0];
                let label_name = self.ident_token(token)?;
                let info = self.label_entry(asm, labels, label_name);
                if info.first_use.is_none() {
                    info.first_use = Some(token);
                }
                let label = info.label;
                if m == "b" {
                    asm.b(label);
                } else {
                    asm.bif(label);
                }
            }
            "call" => {
                let token = inst.operands[0];
                let callee = self.ident_token(token)?;
                let index = *self.name_to_index.get(callee).ok_or_else(
                    || {
                        self.error(
                            token.begin,
                            format!("undefined function: {callee}"),
                        )
                    },
                )?;
                asm.call(index);
            }
            "div" => asm.div(),
            "eq" => asm.eq(),
            "false" => asm.false_(),
            "ge" => asm.ge(),
            "gt" => asm.gt(),
            "int64" => {
                let n = self.int64_token(inst.operands[0])?;
                asm.int64(n);
            }
            "le" => asm.le(),
            "loadarg" => {
                let slot = self.uint16_token(inst.operands[0])?;
                asm.loadarg(slot);
            }
            "loadlocal" => {
                let slot = self.uint16_token(inst.operands[0])?;
                asm.loadlocal(slot);
            }
            "lt" => asm.lt(),
            "mod" => asm.mod_(),
            "mul" => asm.mul(),
            "ne" => asm.ne(),
            "neg" => asm.neg(),
            "nop" => asm.nop(),
            "not" => asm.not_(),
            "or" => asm.or_(),
            "ret" => asm.ret(),
            "shl" => asm.shl(),
            "shr" => asm.shr(),
            "storearg" => {
                let slot = self.uint16_token(inst.operands[0])?;
                asm.storearg(slot);
            }
            "storelocal" => {
                let slot = self.uint16_token(inst.operands[0])?;
                asm.storelocal(slot);
            }
            "sub" => asm.sub(),
            "sys" => {
                let token = inst.operands[0];
                let sys = match self.ident_token(token)? {
                    "exit" => Sys::Exit,
                    "println" => Sys::Println,
                    other => {
                        return Err(self
                            .error(
                                token.begin,
                                format!("undefined system function: {other}"),
                            )
                            .into())
                    }
                };
                asm.sys(sys);
            }
            "true" => asm.true_(),
            "unit" => asm.unit(),
            "xor" => asm.xor_(),
            other => {
                return Err(self
                    .error(
                        inst.mnemonic.begin,
                        format!("unknown instruction '{other}'"),
                    )
                    .into())
            }
        }
        Ok(())
    }

    fn build_types(
        &self,
        tokens: &[Token],
    ) -> Result<Vec<Handle<Type>>, Error> {
        tokens
            .iter()
            .map(|&token| {
                let kind = match self.text(token) {
                    "unit" => TypeKind::Unit,
                    "bool" => TypeKind::Bool,
                    "int64" => TypeKind::Int64,
                    other => {
                        return Err(Error::Parse(self.error(
                            token.begin,
                            format!("unknown type: {other}"),
                        )))
                    }
                };
                Ok(crate::roots::roots().canonical(kind).clone())
            })
            .collect()
    }

    fn ident_token(&self, token: Token) -> Result<&'a str, ParseError> {
        if token.kind != TokenKind::Ident {
            return Err(self.error(
                token.begin,
                format!("expected identifier; found {}", token.kind.name()),
            ));
        }
        Ok(self.text(token))
    }

    fn int64_token(&self, token: Token) -> Result<i64, ParseError> {
        if token.kind != TokenKind::Int {
            return Err(self.error(
                token.begin,
                format!("expected integer; found {}", token.kind.name()),
            ));
        }
        self.text(token).parse().map_err(|_| {
            self.error(token.begin, "expected 64-bit integer".into())
        })
    }

    fn uint16_token(&self, token: Token) -> Result<u16, ParseError> {
        if token.kind != TokenKind::Int {
            return Err(self.error(
                token.begin,
                format!("expected integer; found {}", token.kind.name()),
            ));
        }
        self.text(token).parse().map_err(|_| {
            self.error(token.begin, "expected unsigned 16-bit integer".into())
        })
    }
}

// ── disassembly ────────────────────────────────────────────────────

/// Write the whole package in text form. Branch targets get synthetic
/// labels `L1`, `L2`, … in discovery order; calls print callee names.
pub fn write_package_asm(
    out: &mut dyn Write,
    package: &Package,
) -> Result<(), Error> {
    let io_err = |e: std::io::Error| {
        Error::File(FileError::new(package.path(), format!("cannot write: {e}")))
    };
    let functions = package.functions()?;
    let mut sep = "";
    for function in &functions {
        out.write_all(sep.as_bytes()).map_err(io_err)?;
        sep = "\n\n";
        write_function(out, package, function).map_err(io_err)?;
    }
    out.write_all(b"\n").map_err(io_err)?;
    Ok(())
}

fn write_function(
    out: &mut dyn Write,
    package: &Package,
    function: &Function,
) -> std::io::Result<()> {
    write!(out, "function {}", function.name().as_str())?;
    write_type_list(out, function.param_types().len(), |i| {
        function.param_kind(i)
    })?;
    if !function.return_types().is_empty() {
        write!(out, " -> ")?;
        write_type_list(out, function.return_types().len(), |i| {
            function.return_kind(i)
        })?;
    }
    writeln!(out, " {{")?;

    let insts = function.insts();
    let mut label_indices: HashMap<i64, usize> = HashMap::new();
    let mut next_label = 1;
    for (offset, op) in InstIter::new(insts) {
        if matches!(op, Op::B | Op::Bif) {
            let rel = read_i32(insts, offset + 1).expect("sized") as i64;
            let target = offset as i64 + rel;
            label_indices.entry(target).or_insert_with(|| {
                let index = next_label;
                next_label += 1;
                index
            });
        }
    }

    let mut sep = "";
    for (offset, op) in InstIter::new(insts) {
        out.write_all(sep.as_bytes())?;
        sep = "\n";
        if let Some(index) = label_indices.get(&(offset as i64)) {
            writeln!(out, "L{index}:")?;
        }
        write!(out, "  {}", op.mnemonic())?;
        match op {
            Op::B | Op::Bif => {
                let rel = read_i32(insts, offset + 1).expect("sized") as i64;
                let target = offset as i64 + rel;
                write!(out, " L{}", label_indices[&target])?;
            }
            Op::Call => {
                let index = read_u32(insts, offset + 1).expect("sized");
                match package.function_by_index(index) {
                    Ok(callee) => {
                        write!(out, " {}", callee.name().as_str())?
                    }
                    Err(_) => write!(out, " {index}")?,
                }
            }
            Op::Int64 => {
                let n = read_i64(insts, offset + 1).expect("sized");
                write!(out, " {n}")?;
            }
            Op::LoadArg | Op::LoadLocal | Op::StoreArg | Op::StoreLocal => {
                let n = read_u16(insts, offset + 1).expect("sized");
                write!(out, " {n}")?;
            }
            Op::Sys => {
                let code = insts[offset + 1];
                match Sys::try_from(code) {
                    Ok(sys) => write!(out, " {}", sys.mnemonic())?,
                    Err(_) => write!(out, " {code}")?,
                }
            }
            _ => {}
        }
    }
    write!(out, "\n}}")
}

fn write_type_list(
    out: &mut dyn Write,
    count: usize,
    kind: impl Fn(usize) -> TypeKind,
) -> std::io::Result<()> {
    write!(out, "(")?;
    let mut sep = "";
    for i in 0..count {
        write!(out, "{sep}{}", kind(i))?;
        sep = ", ";
    }
    write!(out, ")")
}
