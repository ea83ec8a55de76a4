//! Instruction compiler
//!
//! Walks a [`ProgramGraph`] and emits a [`CommandScript`]. Statement blocks
//! are visited in `next` order and each produces exactly one instruction;
//! empty value slots are filled with the operation's default.

use std::collections::HashSet;

use tracing::debug;

use crate::errors::CompileError;
use crate::graph::{format_number, Block, BlockId, ProgramGraph};
use crate::instruction::{
    Command, CommandScript, ImageAnchor, Instruction, MouseButton, ScrollDirection,
};

/// Combined value and statement nesting allowed before compilation gives up.
pub const MAX_DEPTH: usize = 256;

/// Block types whose `IMAGE_NAME` field selects a named image.
pub const IMAGE_FIELD_BLOCKS: [&str; 3] = ["wait_for_element", "image_variable", "mouse_move_to_image"];

const DEFAULT_SCROLL_AMOUNT: f64 = 3.0;
const DEFAULT_DURATION_SECS: f64 = 1.0;
const DEFAULT_REPEAT_TIMES: f64 = 1.0;
const DEFAULT_PAGE_WAIT_SECS: f64 = 3.0;
const DEFAULT_ELEMENT_TIMEOUT_SECS: f64 = 30.0;
const DEFAULT_CONFIDENCE_PERCENT: f64 = 80.0;

/// Compiles every top-level statement chain of `graph`, in on-screen order.
pub fn compile(graph: &ProgramGraph) -> Result<CommandScript, CompileError> {
    let script = Compiler::new(graph).compile()?;
    debug!("Compiled program into {} top-level instructions", script.len());
    Ok(script)
}

/// Value produced by a value block.
#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Text(String),
}

pub struct Compiler<'g> {
    graph: &'g ProgramGraph,
    visited: HashSet<BlockId>,
    depth: usize,
}

impl<'g> Compiler<'g> {
    pub fn new(graph: &'g ProgramGraph) -> Self {
        Self {
            graph,
            visited: HashSet::new(),
            depth: 0,
        }
    }

    pub fn compile(mut self) -> Result<CommandScript, CompileError> {
        let mut instructions = Vec::new();
        for id in self.graph.top_blocks() {
            let block = self.lookup(None, id)?;
            if is_value_block(&block.block_type) {
                // Loose value blocks generate nothing.
                continue;
            }
            instructions.extend(self.chain(id)?);
        }
        Ok(CommandScript::new(instructions))
    }

    fn lookup(&self, parent: Option<&Block>, id: &BlockId) -> Result<&'g Block, CompileError> {
        self.graph.block(id).ok_or_else(|| CompileError::DanglingReference {
            block: parent.map(|b| b.id.clone()).unwrap_or_else(|| id.clone()),
            target: id.clone(),
        })
    }

    fn visit(&mut self, block: &Block) -> Result<(), CompileError> {
        // The editor only produces trees, so reaching a block twice means the
        // graph was assembled with a cycle or a shared link.
        if !self.visited.insert(block.id.clone()) {
            return Err(CompileError::CycleDetected {
                block: block.id.clone(),
                block_type: block.block_type.clone(),
            });
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::DepthExceeded {
                max_depth: MAX_DEPTH,
            });
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    /// Compiles a statement chain starting at `head`.
    fn chain(&mut self, head: &BlockId) -> Result<Vec<Instruction>, CompileError> {
        let mut instructions = Vec::new();
        let mut parent: Option<&'g Block> = None;
        let mut current = Some(head.clone());
        while let Some(id) = current {
            let block = self.lookup(parent, &id)?;
            self.visit(block)?;
            instructions.push(self.statement(block)?);
            current = block.next.clone();
            parent = Some(block);
        }
        Ok(instructions)
    }

    fn statement(&mut self, block: &'g Block) -> Result<Instruction, CompileError> {
        let command = match block.block_type.as_str() {
            "mouse_click" => {
                let (x, y) = self.point(block)?;
                Command::Click { x, y }
            }
            "mouse_move" => {
                let (x, y) = self.point(block)?;
                Command::Move { x, y }
            }
            "mouse_move_absolute" => {
                let (x, y) = self.point(block)?;
                Command::MoveAbsolute { x, y }
            }
            "mouse_move_relative" => {
                let (dx, dy) = self.point(block)?;
                Command::MoveRelative { dx, dy }
            }
            "mouse_move_to_image" => Command::MoveToImage {
                image: text_field_or(block, "IMAGE_NAME", ""),
                anchor: enum_field(block, "POSITION", ImageAnchor::Center, ImageAnchor::parse)?,
            },
            "mouse_scroll" => Command::Scroll {
                amount: self.number_input(block, "AMOUNT", DEFAULT_SCROLL_AMOUNT)?.trunc() as i64,
                direction: enum_field(
                    block,
                    "DIRECTION",
                    ScrollDirection::Down,
                    ScrollDirection::parse,
                )?,
            },
            "mouse_single_click" => Command::SingleClick {
                button: button_field(block)?,
            },
            "mouse_double_click" => Command::DoubleClick {
                button: button_field(block)?,
            },
            "mouse_triple_click" => Command::TripleClick {
                button: button_field(block)?,
            },
            "mouse_long_press" => Command::LongPress {
                button: button_field(block)?,
                duration_secs: self.number_input(block, "DURATION", DEFAULT_DURATION_SECS)?,
            },
            "mouse_release" => Command::Release {
                button: button_field(block)?,
            },
            "mouse_middle_click" => Command::MiddleClick,
            "key_press" => Command::KeyPress {
                key: text_field(block, "KEY")?,
            },
            "type_text" => Command::TypeText {
                text: text_field(block, "TEXT")?,
            },
            "browser_open_url" => Command::OpenUrl {
                url: text_field(block, "URL")?,
                wait_for_load: bool_field(block, "WAIT_FOR_LOAD", false)?,
                wait_time_secs: self.number_input(block, "WAIT_TIME", DEFAULT_PAGE_WAIT_SECS)?,
            },
            "browser_refresh" => Command::RefreshBrowser,
            "wait_for_element" => Command::WaitForElement {
                image: text_field_or(block, "IMAGE_NAME", ""),
                timeout_secs: self.number_input(block, "TIMEOUT", DEFAULT_ELEMENT_TIMEOUT_SECS)?,
                confidence_percent: self.number_input(
                    block,
                    "CONFIDENCE",
                    DEFAULT_CONFIDENCE_PERCENT,
                )?,
            },
            "wait" => {
                return Ok(Instruction::Wait {
                    seconds: self.number_input(block, "TIME", DEFAULT_DURATION_SECS)?,
                });
            }
            "repeat_times" | "controls_repeat_ext" => {
                let times = self.number_input(block, "TIMES", DEFAULT_REPEAT_TIMES)?;
                return self.repeat(block, times);
            }
            "controls_repeat" => {
                let times = match block.field("TIMES") {
                    Some(value) => value.as_number().ok_or_else(|| CompileError::InvalidField {
                        block_type: block.block_type.clone(),
                        field: "TIMES".to_string(),
                        value: value.as_text(),
                    })?,
                    None => DEFAULT_REPEAT_TIMES,
                };
                return self.repeat(block, times);
            }
            other if is_value_block(other) => {
                return Err(CompileError::NotAStatement {
                    block_type: other.to_string(),
                })
            }
            other => {
                return Err(CompileError::UnknownBlock {
                    block: block.id.clone(),
                    block_type: other.to_string(),
                })
            }
        };
        Ok(Instruction::command(command))
    }

    fn repeat(&mut self, block: &'g Block, times: f64) -> Result<Instruction, CompileError> {
        if !times.is_finite() {
            return Err(CompileError::InvalidField {
                block_type: block.block_type.clone(),
                field: "TIMES".to_string(),
                value: format_number(times),
            });
        }
        // A counting loop `i < times` runs ceil(times) passes, none when negative.
        let times = times.ceil().max(0.0) as u64;

        self.descend()?;
        let body = match block.input("DO") {
            Some(head) => self.chain(head)?,
            None => Vec::new(),
        };
        self.ascend();

        Ok(Instruction::Repeat {
            times,
            body: CommandScript::new(body),
        })
    }

    fn point(&mut self, block: &'g Block) -> Result<(i64, i64), CompileError> {
        let x = self.number_input(block, "X", 0.0)?;
        let y = self.number_input(block, "Y", 0.0)?;
        Ok((x.trunc() as i64, y.trunc() as i64))
    }

    fn number_input(
        &mut self,
        block: &'g Block,
        input: &str,
        default: f64,
    ) -> Result<f64, CompileError> {
        match self.value_input(block, input)? {
            None => Ok(default),
            Some(Literal::Number(n)) => Ok(n),
            Some(Literal::Text(text)) => {
                text.trim()
                    .parse::<f64>()
                    .map_err(|_| CompileError::TypeMismatch {
                        block_type: block.block_type.clone(),
                        input: input.to_string(),
                        found: text.clone(),
                    })
            }
        }
    }

    /// Resolves the child connected to `input`, or `None` if the slot is empty.
    fn value_input(
        &mut self,
        block: &'g Block,
        input: &str,
    ) -> Result<Option<Literal>, CompileError> {
        let Some(child_id) = block.input(input) else {
            return Ok(None);
        };
        let child = self.lookup(Some(block), child_id)?;
        self.visit(child)?;
        self.descend()?;
        let value = self.value(child);
        self.ascend();
        value.map(Some)
    }

    fn value(&mut self, block: &'g Block) -> Result<Literal, CompileError> {
        match block.block_type.as_str() {
            "math_number" => {
                let value = block.field("NUM").ok_or_else(|| CompileError::MissingField {
                    block_type: block.block_type.clone(),
                    field: "NUM".to_string(),
                })?;
                value
                    .as_number()
                    .map(Literal::Number)
                    .ok_or_else(|| CompileError::InvalidField {
                        block_type: block.block_type.clone(),
                        field: "NUM".to_string(),
                        value: value.as_text(),
                    })
            }
            "text" => Ok(Literal::Text(text_field_or(block, "TEXT", ""))),
            "image_variable" => Ok(Literal::Text(text_field_or(block, "IMAGE_NAME", ""))),
            "math_arithmetic" => {
                let op = text_field(block, "OP")?;
                let a = self.number_input(block, "A", 0.0)?;
                let b = self.number_input(block, "B", 0.0)?;
                let result = match op.as_str() {
                    "ADD" => a + b,
                    "MINUS" => a - b,
                    "MULTIPLY" => a * b,
                    "DIVIDE" => a / b,
                    "POWER" => a.powf(b),
                    _ => {
                        return Err(CompileError::InvalidField {
                            block_type: block.block_type.clone(),
                            field: "OP".to_string(),
                            value: op,
                        })
                    }
                };
                Ok(Literal::Number(result))
            }
            other => Err(if is_statement_block(other) {
                CompileError::NotAValue {
                    block_type: other.to_string(),
                }
            } else {
                CompileError::UnknownBlock {
                    block: block.id.clone(),
                    block_type: other.to_string(),
                }
            }),
        }
    }
}

fn is_value_block(block_type: &str) -> bool {
    matches!(
        block_type,
        "math_number" | "text" | "image_variable" | "math_arithmetic"
    )
}

fn is_statement_block(block_type: &str) -> bool {
    matches!(
        block_type,
        "mouse_click"
            | "mouse_move"
            | "mouse_move_absolute"
            | "mouse_move_relative"
            | "mouse_move_to_image"
            | "mouse_scroll"
            | "mouse_single_click"
            | "mouse_double_click"
            | "mouse_triple_click"
            | "mouse_long_press"
            | "mouse_release"
            | "mouse_middle_click"
            | "key_press"
            | "type_text"
            | "browser_open_url"
            | "browser_refresh"
            | "wait_for_element"
            | "wait"
            | "repeat_times"
            | "controls_repeat_ext"
            | "controls_repeat"
    )
}

fn text_field(block: &Block, field: &str) -> Result<String, CompileError> {
    block
        .field(field)
        .map(|value| value.as_text())
        .ok_or_else(|| CompileError::MissingField {
            block_type: block.block_type.clone(),
            field: field.to_string(),
        })
}

fn text_field_or(block: &Block, field: &str, default: &str) -> String {
    block
        .field(field)
        .map(|value| value.as_text())
        .unwrap_or_else(|| default.to_string())
}

fn bool_field(block: &Block, field: &str, default: bool) -> Result<bool, CompileError> {
    match block.field(field) {
        None => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| CompileError::InvalidField {
            block_type: block.block_type.clone(),
            field: field.to_string(),
            value: value.as_text(),
        }),
    }
}

fn enum_field<T>(
    block: &Block,
    field: &str,
    default: T,
    parse: fn(&str) -> Option<T>,
) -> Result<T, CompileError> {
    match block.field(field) {
        None => Ok(default),
        Some(value) => {
            let token = value.as_text();
            parse(&token).ok_or_else(|| CompileError::InvalidField {
                block_type: block.block_type.clone(),
                field: field.to_string(),
                value: token,
            })
        }
    }
}

fn button_field(block: &Block) -> Result<MouseButton, CompileError> {
    enum_field(block, "BUTTON", MouseButton::Left, MouseButton::parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Block, FieldValue, GraphBuilder};

    fn number(id: &str, value: f64) -> Block {
        Block::new(id, "math_number").with_number("NUM", value)
    }

    #[test]
    fn test_empty_wait_slot_defaults_to_one_second() {
        let graph = GraphBuilder::new().top(Block::new("w", "wait")).build();
        let script = compile(&graph).unwrap();
        assert_eq!(script.instructions(), &[Instruction::Wait { seconds: 1.0 }]);
    }

    #[test]
    fn test_repeat_owns_nested_script() {
        let graph = GraphBuilder::new()
            .top(
                Block::new("r", "repeat_times")
                    .with_input("TIMES", "n3")
                    .with_input("DO", "c"),
            )
            .block(number("n3", 3.0))
            .block(
                Block::new("c", "mouse_click")
                    .with_input("X", "n1")
                    .with_input("Y", "n2"),
            )
            .block(number("n1", 1.0))
            .block(number("n2", 2.0))
            .build();

        let script = compile(&graph).unwrap();
        assert_eq!(
            script.instructions(),
            &[Instruction::Repeat {
                times: 3,
                body: CommandScript::new(vec![Instruction::command(Command::Click { x: 1, y: 2 })]),
            }]
        );
    }

    #[test]
    fn test_defaults_for_unconnected_slots() {
        let graph = GraphBuilder::new()
            .top(Block::new("s", "mouse_scroll").with_next("l"))
            .block(Block::new("l", "mouse_long_press").with_next("e"))
            .block(Block::new("e", "wait_for_element").with_text("IMAGE_NAME", "logo"))
            .build();

        let script = compile(&graph).unwrap();
        assert_eq!(
            script.instructions(),
            &[
                Instruction::command(Command::Scroll {
                    amount: 3,
                    direction: ScrollDirection::Down
                }),
                Instruction::command(Command::LongPress {
                    button: MouseButton::Left,
                    duration_secs: 1.0
                }),
                Instruction::command(Command::WaitForElement {
                    image: "logo".to_string(),
                    timeout_secs: 30.0,
                    confidence_percent: 80.0
                }),
            ]
        );
    }

    #[test]
    fn test_text_round_trips_without_escaping() {
        let tricky = r#"it's a "quote" \ backslash"#;
        let graph = GraphBuilder::new()
            .top(Block::new("t", "type_text").with_text("TEXT", tricky))
            .build();
        let script = compile(&graph).unwrap();
        assert_eq!(
            script.instructions(),
            &[Instruction::command(Command::TypeText {
                text: tricky.to_string()
            })]
        );
    }

    #[test]
    fn test_missing_required_field_names_block_and_field() {
        let graph = GraphBuilder::new().top(Block::new("k", "key_press")).build();
        let err = compile(&graph).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingField {
                block_type: "key_press".to_string(),
                field: "KEY".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_enum_token() {
        let graph = GraphBuilder::new()
            .top(Block::new("b", "mouse_release").with_text("BUTTON", "middle"))
            .build();
        assert!(matches!(
            compile(&graph),
            Err(CompileError::InvalidField { field, .. }) if field == "BUTTON"
        ));
    }

    #[test]
    fn test_text_in_numeric_slot() {
        let graph = GraphBuilder::new()
            .top(Block::new("w", "wait").with_input("TIME", "t"))
            .block(Block::new("t", "text").with_text("TEXT", "soon"))
            .build();
        assert!(matches!(
            compile(&graph),
            Err(CompileError::TypeMismatch { input, found, .. }) if input == "TIME" && found == "soon"
        ));

        let numeric_text = GraphBuilder::new()
            .top(Block::new("w", "wait").with_input("TIME", "t"))
            .block(Block::new("t", "text").with_text("TEXT", "2.5"))
            .build();
        assert_eq!(
            compile(&numeric_text).unwrap().instructions(),
            &[Instruction::Wait { seconds: 2.5 }]
        );
    }

    #[test]
    fn test_arithmetic_is_folded() {
        let graph = GraphBuilder::new()
            .top(Block::new("w", "wait").with_input("TIME", "sum"))
            .block(
                Block::new("sum", "math_arithmetic")
                    .with_text("OP", "MULTIPLY")
                    .with_input("A", "a")
                    .with_input("B", "b"),
            )
            .block(number("a", 1.5))
            .block(number("b", 4.0))
            .build();
        assert_eq!(
            compile(&graph).unwrap().instructions(),
            &[Instruction::Wait { seconds: 6.0 }]
        );
    }

    #[test]
    fn test_next_cycle_is_compile_error() {
        let graph = GraphBuilder::new()
            .top(Block::new("a", "browser_refresh").with_next("b"))
            .block(Block::new("b", "mouse_middle_click").with_next("a"))
            .build();
        assert!(matches!(
            compile(&graph),
            Err(CompileError::CycleDetected { block, .. }) if block.as_str() == "a"
        ));
    }

    #[test]
    fn test_repeat_body_cycle_is_compile_error() {
        let graph = GraphBuilder::new()
            .top(Block::new("r", "repeat_times").with_input("DO", "r"))
            .build();
        assert!(matches!(
            compile(&graph),
            Err(CompileError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut builder = GraphBuilder::new();
        let levels = MAX_DEPTH + 5;
        for level in 0..levels {
            let mut block = Block::new(format!("r{level}"), "repeat_times");
            if level + 1 < levels {
                block = block.with_input("DO", format!("r{}", level + 1));
            }
            builder = if level == 0 {
                builder.top(block)
            } else {
                builder.block(block)
            };
        }
        assert_eq!(
            compile(&builder.build()),
            Err(CompileError::DepthExceeded {
                max_depth: MAX_DEPTH
            })
        );
    }

    #[test]
    fn test_dangling_reference() {
        let graph = GraphBuilder::new()
            .top(Block::new("a", "browser_refresh").with_next("ghost"))
            .build();
        assert!(matches!(
            compile(&graph),
            Err(CompileError::DanglingReference { target, .. }) if target.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_unknown_and_misplaced_blocks() {
        let unknown = GraphBuilder::new().top(Block::new("x", "teleport")).build();
        assert!(matches!(
            compile(&unknown),
            Err(CompileError::UnknownBlock { block_type, .. }) if block_type == "teleport"
        ));

        let statement_as_value = GraphBuilder::new()
            .top(Block::new("w", "wait").with_input("TIME", "r"))
            .block(Block::new("r", "browser_refresh"))
            .build();
        assert!(matches!(
            compile(&statement_as_value),
            Err(CompileError::NotAValue { .. })
        ));
    }

    #[test]
    fn test_repeat_count_rounding() {
        for (count, expected) in [(2.5, 3), (-4.0, 0), (0.0, 0)] {
            let graph = GraphBuilder::new()
                .top(Block::new("r", "repeat_times").with_input("TIMES", "n"))
                .block(number("n", count))
                .build();
            match compile(&graph).unwrap().instructions() {
                [Instruction::Repeat { times, .. }] => assert_eq!(*times, expected),
                other => panic!("unexpected script: {other:?}"),
            }
        }
    }

    #[test]
    fn test_loose_value_blocks_are_ignored() {
        let graph = GraphBuilder::new()
            .top(number("loose", 9.0))
            .top(Block::new("r", "browser_refresh"))
            .build();
        assert_eq!(
            compile(&graph).unwrap().instructions(),
            &[Instruction::command(Command::RefreshBrowser)]
        );
    }

    #[test]
    fn test_open_url_options() {
        let graph = GraphBuilder::new()
            .top(
                Block::new("u", "browser_open_url")
                    .with_text("URL", "https://example.com/?q='x'")
                    .with_field("WAIT_FOR_LOAD", FieldValue::Bool(true)),
            )
            .build();
        assert_eq!(
            compile(&graph).unwrap().instructions(),
            &[Instruction::command(Command::OpenUrl {
                url: "https://example.com/?q='x'".to_string(),
                wait_for_load: true,
                wait_time_secs: 3.0
            })]
        );
    }
}
