use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::asmfile::ast::*;
use crate::errors::CompileError;

#[derive(Parser)]
#[grammar = "asmfile/grammar.pest"]
pub struct AsmParser;

/// Parses one external assembly file's text into a sequence of lines (spec
/// §4.? "Assembly Reader" / §6 "Input assembly files").
pub fn parse_source(source: &str) -> Result<Vec<AsmLine>, CompileError> {
    let pairs = AsmParser::parse(Rule::program, source)?;
    let mut lines = Vec::new();

    for line_pair in pairs.flatten().filter(|p| p.as_rule() == Rule::line) {
        let line_number = line_pair.as_span().start_pos().line_col().0;
        let mut asm_line = AsmLine { line_number, ..Default::default() };

        for inner in line_pair.into_inner() {
            match inner.as_rule() {
                Rule::label => {
                    let text = inner.as_str();
                    asm_line.label = Some(text.trim_end_matches(':').to_string());
                }
                Rule::statement => {
                    asm_line.statement = Some(build_statement(inner)?);
                }
                _ => {}
            }
        }

        if asm_line.label.is_some() || asm_line.statement.is_some() {
            lines.push(asm_line);
        }
    }

    Ok(lines)
}

fn build_statement(pair: Pair<Rule>) -> Result<Statement, CompileError> {
    let inner = pair.into_inner().next().expect("statement has one child");
    Ok(match inner.as_rule() {
        Rule::directive => Statement::Directive(build_directive(inner)?),
        Rule::instruction => Statement::Instruction(build_instruction(inner)?),
        _ => unreachable!("unexpected statement child: {:?}", inner.as_rule()),
    })
}

fn build_directive(pair: Pair<Rule>) -> Result<Directive, CompileError> {
    let inner = pair.into_inner().next().expect("directive has one child");
    Ok(match inner.as_rule() {
        Rule::segment_directive => {
            let s = inner.into_inner().next().unwrap();
            Directive::Segment(unquote(s.as_str()))
        }
        Rule::import_directive => Directive::Import(inner.into_inner().next().unwrap().as_str().to_string()),
        Rule::export_directive => Directive::Export(inner.into_inner().next().unwrap().as_str().to_string()),
        Rule::byte_directive => {
            let items = inner
                .into_inner()
                .map(build_byte_item)
                .collect::<Result<Vec<_>, _>>()?;
            Directive::Byte(items)
        }
        Rule::word_directive => {
            let items = inner.into_inner().map(build_value).collect();
            Directive::Word(items)
        }
        Rule::res_directive => {
            let n = inner.into_inner().next().unwrap();
            Directive::Res(parse_number(n.as_str()))
        }
        other => unreachable!("unexpected directive rule: {other:?}"),
    })
}

fn build_byte_item(pair: Pair<Rule>) -> Result<ByteItem, CompileError> {
    let inner = pair.into_inner().next().unwrap();
    Ok(match inner.as_rule() {
        Rule::string => ByteItem::Str(unquote(inner.as_str())),
        Rule::number => {
            let v = parse_number(inner.as_str());
            if v > 0xFF {
                return Err(CompileError::Capacity {
                    reason: format!(".byte value {v} does not fit in a byte"),
                });
            }
            ByteItem::Number(v as u8)
        }
        other => unreachable!("unexpected byte_item rule: {other:?}"),
    })
}

fn build_instruction(pair: Pair<Rule>) -> Result<AsmInstruction, CompileError> {
    let mut inner = pair.into_inner();
    let mnemonic = inner.next().unwrap().as_str().to_ascii_uppercase();
    let operand = match inner.next() {
        Some(op_pair) => Some(build_operand(op_pair)),
        None => None,
    };
    Ok(AsmInstruction { mnemonic, operand })
}

fn build_operand(pair: Pair<Rule>) -> AsmOperand {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::immediate => {
            let child = inner.into_inner().next().unwrap();
            match child.as_rule() {
                Rule::lobyte => AsmOperand::Immediate(
                    ByteSelector::Low,
                    build_value(child.into_inner().next().unwrap()),
                ),
                Rule::hibyte => AsmOperand::Immediate(
                    ByteSelector::High,
                    build_value(child.into_inner().next().unwrap()),
                ),
                Rule::value => AsmOperand::Immediate(ByteSelector::None, build_value(child)),
                other => unreachable!("unexpected immediate rule: {other:?}"),
            }
        }
        Rule::indexed_indirect_x => {
            AsmOperand::IndexedIndirectX(build_value(inner.into_inner().next().unwrap()))
        }
        Rule::indirect_indexed_y => {
            AsmOperand::IndirectIndexedY(build_value(inner.into_inner().next().unwrap()))
        }
        Rule::indirect => AsmOperand::Indirect(build_value(inner.into_inner().next().unwrap())),
        Rule::abs_indexed_x => AsmOperand::AbsIndexedX(build_value(inner.into_inner().next().unwrap())),
        Rule::abs_indexed_y => AsmOperand::AbsIndexedY(build_value(inner.into_inner().next().unwrap())),
        Rule::value => AsmOperand::Value(build_value(inner.into_inner().next().unwrap())),
        other => unreachable!("unexpected operand rule: {other:?}"),
    }
}

fn build_value(pair: Pair<Rule>) -> Value {
    // `value = { number | identifier }` or a bare `word_item`/`byte_item`
    // number/identifier pair — either way, one child telling us which.
    let target = if pair.as_rule() == Rule::value { pair.into_inner().next().unwrap() } else { pair };
    match target.as_rule() {
        Rule::number => Value::Number(parse_number(target.as_str())),
        Rule::identifier => Value::Ident(target.as_str().to_string()),
        other => unreachable!("unexpected value rule: {other:?}"),
    }
}

fn parse_number(text: &str) -> u32 {
    if let Some(hex) = text.strip_prefix('$') {
        u32::from_str_radix(hex, 16).expect("grammar guarantees hex digits")
    } else if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).expect("grammar guarantees hex digits")
    } else {
        text.parse().expect("grammar guarantees decimal digits")
    }
}

fn unquote(text: &str) -> String {
    text.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_label_and_instruction() {
        let lines = parse_source("start:\n  LDA #$01\n  STA $0200\n").unwrap();
        assert_eq!(lines[0].label.as_deref(), Some("start"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn parses_low_high_byte_immediates() {
        let lines = parse_source("  LDA #<message\n  LDX #>message\n").unwrap();
        let op0 = match &lines[0].statement {
            Some(Statement::Instruction(i)) => i.operand.clone().unwrap(),
            _ => panic!("expected instruction"),
        };
        assert_eq!(op0, AsmOperand::Immediate(ByteSelector::Low, Value::Ident("message".into())));
        let op1 = match &lines[1].statement {
            Some(Statement::Instruction(i)) => i.operand.clone().unwrap(),
            _ => panic!("expected instruction"),
        };
        assert_eq!(op1, AsmOperand::Immediate(ByteSelector::High, Value::Ident("message".into())));
    }

    #[test]
    fn parses_chars_segment_and_byte_directive() {
        let lines = parse_source(".segment \"CHARS\"\ntile0:\n  .byte $00, $FF, 1, 2\n").unwrap();
        let seg = lines
            .iter()
            .find_map(|l| match &l.statement {
                Some(Statement::Directive(Directive::Segment(name))) => Some(name.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(seg, "CHARS");
    }
}
