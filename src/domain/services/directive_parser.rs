//! Directive parsing
//!
//! Turns an inbound webhook payload into a canonical [`TradeDirective`].
//! Two input shapes are accepted:
//!
//! - free-text alerts following the grammar
//!   `[<strategy-tag>] <LONG|SHORT> <Entry|Exit>[(<reason>)][!] Symbol: <SYMBOL>[,] [Price: <PRICE>]`
//! - structured objects `{symbol, action: BUY|SELL|CLOSE, price?, positionAfter?: -1|0|1, barTime?}`
//!
//! Anything that does not match fails closed with a [`ParseError`] carrying the
//! raw text. A side is never guessed.

use crate::domain::entities::directive::{Side, TradeDirective};
use crate::domain::errors::{EngineError, ParseError, ValidationError};
use crate::domain::value_objects::price::Price;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SYMBOL_LABEL: &str = "symbol:";
const PRICE_LABEL: &str = "price:";

/// Body accepted by the directive endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DirectivePayload {
    Alert {
        #[serde(rename = "alertText")]
        alert_text: String,
    },
    Structured(StructuredDirective),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredDirective {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    /// Number or numeric string
    #[serde(default)]
    pub price: Option<Value>,
    /// -1, 0 or 1, as number or string
    #[serde(default)]
    pub position_after: Option<Value>,
    #[serde(default)]
    pub bar_time: Option<Value>,
}

pub fn parse_payload(payload: &DirectivePayload) -> Result<TradeDirective, EngineError> {
    match payload {
        DirectivePayload::Alert { alert_text } => Ok(parse_alert_text(alert_text)?),
        DirectivePayload::Structured(structured) => parse_structured(structured),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Reason(String),
    Bang,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Entry,
    Exit,
}

/// Split the alert header into words, a parenthesised reason and `!` markers
fn tokenize_header(header: &str, raw: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = header.chars();

    fn flush(word: &mut String, tokens: &mut Vec<Token>) {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                flush(&mut word, &mut tokens);
                let mut reason = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ')' {
                        closed = true;
                        break;
                    }
                    reason.push(inner);
                }
                if !closed {
                    return Err(ParseError::new(raw, "unclosed reason parenthesis"));
                }
                tokens.push(Token::Reason(reason));
            }
            ')' => return Err(ParseError::new(raw, "unexpected ')'")),
            '!' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Bang);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    Ok(tokens)
}

fn direction_of(token: &Token) -> Option<Side> {
    match token {
        Token::Word(w) if w.eq_ignore_ascii_case("long") => Some(Side::Long),
        Token::Word(w) if w.eq_ignore_ascii_case("short") => Some(Side::Short),
        _ => None,
    }
}

fn phase_of(token: &Token) -> Option<Phase> {
    match token {
        Token::Word(w) if w.eq_ignore_ascii_case("entry") => Some(Phase::Entry),
        Token::Word(w) if w.eq_ignore_ascii_case("exit") => Some(Phase::Exit),
        _ => None,
    }
}

/// `"MA Cross"` -> `"ma_cross"`
pub fn normalize_reason(reason: &str) -> Option<String> {
    let mut out = String::with_capacity(reason.len());
    let mut pending_sep = false;
    for c in reason.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn find_label(haystack: &str, label: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(label)
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':')
}

/// Parse free-text alert text.
pub fn parse_alert_text(text: &str) -> Result<TradeDirective, ParseError> {
    let raw = text.trim();
    if raw.is_empty() {
        return Err(ParseError::new(text, "empty alert text"));
    }

    let symbol_at = find_label(raw, SYMBOL_LABEL)
        .ok_or_else(|| ParseError::new(raw, "missing 'Symbol:' field"))?;
    let header = &raw[..symbol_at];
    let fields = &raw[symbol_at + SYMBOL_LABEL.len()..];

    let tokens = tokenize_header(header, raw)?;
    let position = tokens
        .windows(2)
        .position(|pair| direction_of(&pair[0]).is_some() && phase_of(&pair[1]).is_some())
        .ok_or_else(|| ParseError::new(raw, "no '<LONG|SHORT> <Entry|Exit>' pair"))?;

    let direction = direction_of(&tokens[position])
        .ok_or_else(|| ParseError::new(raw, "no direction token"))?;
    let phase = phase_of(&tokens[position + 1])
        .ok_or_else(|| ParseError::new(raw, "no phase token"))?;

    // Strategy tag words may not themselves contain a direction
    if tokens[..position].iter().any(|t| !matches!(t, Token::Word(_)) || direction_of(t).is_some()) {
        return Err(ParseError::new(raw, "ambiguous header before direction"));
    }

    let mut reason = None;
    let mut rest = tokens[position + 2..].iter().peekable();
    if let Some(Token::Reason(r)) = rest.peek() {
        reason = normalize_reason(r);
        rest.next();
    }
    if let Some(Token::Bang) = rest.peek() {
        rest.next();
    }
    if let Some(extra) = rest.next() {
        return Err(ParseError::new(
            raw,
            format!("unexpected token after phase: {:?}", extra),
        ));
    }

    let fields = fields.trim_start();
    let symbol_len = fields
        .find(|c: char| !is_symbol_char(c))
        .unwrap_or(fields.len());
    let symbol = fields[..symbol_len].trim_end_matches(':');
    if symbol.is_empty() {
        return Err(ParseError::new(raw, "empty symbol"));
    }

    let remainder = fields[symbol_len..].trim_start();
    let remainder = remainder.strip_prefix(',').unwrap_or(remainder).trim();
    let price_hint = if remainder.is_empty() {
        None
    } else {
        let lower = remainder.to_ascii_lowercase();
        if !lower.starts_with(PRICE_LABEL) {
            return Err(ParseError::new(raw, "unexpected text after symbol"));
        }
        let value = remainder[PRICE_LABEL.len()..].trim();
        let price = Price::parse(value)
            .map_err(|e| ParseError::new(raw, format!("bad price: {}", e)))?;
        Some(price.value())
    };

    let desired_side = match phase {
        Phase::Entry => direction,
        Phase::Exit => Side::Flat,
    };

    Ok(TradeDirective {
        symbol: symbol.to_string(),
        desired_side,
        price_hint,
        reason_tag: reason,
        raw_source: raw.to_string(),
        bar_time: None,
    })
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn side_from_position_after(value: &Value) -> Result<Side, ValidationError> {
    let number = value_to_f64(value)
        .ok_or_else(|| ValidationError::invalid("positionAfter", "must be -1, 0 or 1"))?;
    if number == 1.0 {
        Ok(Side::Long)
    } else if number == 0.0 {
        Ok(Side::Flat)
    } else if number == -1.0 {
        Ok(Side::Short)
    } else {
        Err(ValidationError::invalid(
            "positionAfter",
            format!("{} is not one of -1, 0, 1", number),
        ))
    }
}

/// Parse a structured directive. `positionAfter` wins over `action` when both are present.
pub fn parse_structured(input: &StructuredDirective) -> Result<TradeDirective, EngineError> {
    let raw = serde_json::to_string(input).unwrap_or_default();

    let symbol = input
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::MissingField("symbol".to_string()))?;
    if !symbol.chars().all(is_symbol_char) {
        return Err(ValidationError::invalid("symbol", format!("'{}' has invalid characters", symbol)).into());
    }

    let desired_side = match (&input.position_after, &input.action) {
        (Some(position_after), _) if !position_after.is_null() => {
            side_from_position_after(position_after)?
        }
        (_, Some(action)) => match action.trim().to_ascii_uppercase().as_str() {
            "BUY" => Side::Long,
            "SELL" => Side::Short,
            "CLOSE" => Side::Flat,
            _ => return Err(ParseError::new(raw, format!("unknown action '{}'", action)).into()),
        },
        _ => return Err(ValidationError::MissingField("action".to_string()).into()),
    };

    let price_hint = match &input.price {
        None | Some(Value::Null) => None,
        Some(value) => {
            let number = value_to_f64(value)
                .ok_or_else(|| ValidationError::invalid("price", "must be a number"))?;
            Some(Price::new(number)?.value())
        }
    };

    Ok(TradeDirective {
        symbol: symbol.to_string(),
        desired_side,
        price_hint,
        reason_tag: None,
        raw_source: raw,
        bar_time: input.bar_time.as_ref().and_then(value_to_string),
    })
}
