//! Regex rendering by state elimination.
//!
//! The automaton is first minimized, then lifted into a generalized NFA
//! whose edges carry small regex ASTs; interior states are eliminated one by
//! one, folding their in/out edges into `pred · loop* · succ` alternations.
//! The surviving init→final edge is the rendered pattern.

use super::{Fsm, ALPHABET};

/// A never-matching pattern, used for the empty language (character classes
/// are not allowed to be empty in the regex syntax, so `\z` followed by a
/// required byte stands in).
const EMPTY_PATTERN: &str = "\\z.";

pub(crate) fn to_regex(fsm: &Fsm) -> String {
    let m = fsm.minimized();
    let n = m.state_count();

    // Live states: reachable and able to reach an accepting state.
    let reachable = m.reachable();
    let useful = m.useful();
    let live: Vec<bool> = reachable
        .iter()
        .zip(&useful)
        .map(|(&r, &u)| r && u)
        .collect();
    if !live[m.start() as usize] {
        return EMPTY_PATTERN.to_owned();
    }
    let index: Vec<Option<usize>> = {
        let mut next = 0;
        (0..n)
            .map(|s| {
                live[s].then(|| {
                    let i = next;
                    next += 1;
                    i
                })
            })
            .collect()
    };
    let count = index.iter().flatten().count();
    let init = count;
    let fin = count + 1;
    let total = count + 2;

    let mut mat = vec![Ast::Empty; total * total];
    let mut set = |mat: &mut Vec<Ast>, from: usize, to: usize, ast: Ast| {
        let cur = std::mem::replace(&mut mat[from * total + to], Ast::Empty);
        mat[from * total + to] = alt(cur, ast);
    };

    set(&mut mat, init, index[m.start() as usize].unwrap(), Ast::Eps);
    for s in 0..n {
        let Some(from) = index[s] else { continue };
        if m.accepts_state(s as u32) {
            set(&mut mat, from, fin, Ast::Eps);
        }
        let mut bytes_to: Vec<Vec<u8>> = vec![Vec::new(); count];
        for b in 0..ALPHABET {
            let t = m.next_state(s as u32, b as u8);
            if let Some(to) = index[t as usize] {
                bytes_to[to].push(b as u8);
            }
        }
        for (to, bytes) in bytes_to.into_iter().enumerate() {
            if !bytes.is_empty() {
                set(&mut mat, from, to, Ast::Class(bytes));
            }
        }
    }

    // Eliminate interior states, cheapest fan-in × fan-out first.
    let mut alive: Vec<bool> = vec![true; count];
    for _ in 0..count {
        let k = (0..count)
            .filter(|&k| alive[k])
            .min_by_key(|&k| {
                let preds = (0..total)
                    .filter(|&p| p != k && mat[p * total + k] != Ast::Empty)
                    .count();
                let succs = (0..total)
                    .filter(|&q| q != k && mat[k * total + q] != Ast::Empty)
                    .count();
                preds * succs
            })
            .unwrap();
        alive[k] = false;
        let loop_ast = star(mat[k * total + k].clone());
        let preds: Vec<usize> = (0..total)
            .filter(|&p| p != k && mat[p * total + k] != Ast::Empty)
            .collect();
        let succs: Vec<usize> = (0..total)
            .filter(|&q| q != k && mat[k * total + q] != Ast::Empty)
            .collect();
        for &p in &preds {
            for &q in &succs {
                let bridge = concat(vec![
                    mat[p * total + k].clone(),
                    loop_ast.clone(),
                    mat[k * total + q].clone(),
                ]);
                set(&mut mat, p, q, bridge);
            }
        }
        for x in 0..total {
            mat[x * total + k] = Ast::Empty;
            mat[k * total + x] = Ast::Empty;
        }
    }

    match &mat[init * total + fin] {
        Ast::Empty => EMPTY_PATTERN.to_owned(),
        ast => render(ast, Prec::Alt),
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Ast {
    /// Matches nothing.
    Empty,
    /// Matches the empty string.
    Eps,
    /// Matches any single byte from the (sorted) set.
    Class(Vec<u8>),
    Concat(Vec<Ast>),
    Alt(Vec<Ast>),
    Star(Box<Ast>),
}

fn alt(a: Ast, b: Ast) -> Ast {
    let mut parts = Vec::new();
    let mut bytes: Vec<u8> = Vec::new();
    let mut has_eps = false;
    let mut push = |ast: Ast, parts: &mut Vec<Ast>, bytes: &mut Vec<u8>, has_eps: &mut bool| {
        match ast {
            Ast::Empty => {}
            Ast::Eps => *has_eps = true,
            Ast::Class(bs) => bytes.extend(bs),
            other => {
                if !parts.contains(&other) {
                    parts.push(other);
                }
            }
        }
    };
    for ast in [a, b] {
        match ast {
            Ast::Alt(subs) => {
                for sub in subs {
                    push(sub, &mut parts, &mut bytes, &mut has_eps);
                }
            }
            other => push(other, &mut parts, &mut bytes, &mut has_eps),
        }
    }
    if !bytes.is_empty() {
        bytes.sort_unstable();
        bytes.dedup();
        parts.insert(0, Ast::Class(bytes));
    }
    if has_eps {
        parts.insert(0, Ast::Eps);
    }
    match parts.len() {
        0 => Ast::Empty,
        1 => parts.pop().unwrap(),
        _ => Ast::Alt(parts),
    }
}

fn concat(parts: Vec<Ast>) -> Ast {
    let mut out = Vec::new();
    for part in parts {
        match part {
            Ast::Empty => return Ast::Empty,
            Ast::Eps => {}
            Ast::Concat(subs) => out.extend(subs),
            other => out.push(other),
        }
    }
    match out.len() {
        0 => Ast::Eps,
        1 => out.pop().unwrap(),
        _ => Ast::Concat(out),
    }
}

fn star(ast: Ast) -> Ast {
    match ast {
        Ast::Empty | Ast::Eps => Ast::Eps,
        star @ Ast::Star(_) => star,
        other => Ast::Star(Box::new(other)),
    }
}

/// Rendering precedence, loosest first.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    Alt,
    Concat,
    Repeat,
}

fn render(ast: &Ast, parent: Prec) -> String {
    match ast {
        Ast::Empty => EMPTY_PATTERN.to_owned(),
        Ast::Eps => String::new(),
        Ast::Class(bytes) => render_class(bytes),
        Ast::Concat(parts) => {
            let body: String = parts.iter().map(|p| render(p, Prec::Concat)).collect();
            group_if(body, Prec::Concat < parent)
        }
        Ast::Alt(parts) => {
            if let Some(rest) = optional_body(parts) {
                let body = format!("{}?", render_atom(&rest));
                group_if(body, Prec::Repeat < parent)
            } else {
                let body = parts
                    .iter()
                    .map(|p| render(p, Prec::Alt))
                    .collect::<Vec<_>>()
                    .join("|");
                group_if(body, Prec::Alt < parent)
            }
        }
        Ast::Star(inner) => {
            let body = format!("{}*", render_atom(inner));
            group_if(body, Prec::Repeat < parent)
        }
    }
}

/// `Eps | R` renders as `R?` instead of an alternation with an empty branch.
fn optional_body(parts: &[Ast]) -> Option<Ast> {
    match parts {
        [Ast::Eps, rest @ ..] if !rest.is_empty() => Some(if rest.len() == 1 {
            rest[0].clone()
        } else {
            Ast::Alt(rest.to_vec())
        }),
        _ => None,
    }
}

fn render_atom(ast: &Ast) -> String {
    match ast {
        Ast::Class(_) => render(ast, Prec::Repeat),
        _ => format!("(?:{})", render(ast, Prec::Alt)),
    }
}

fn group_if(body: String, needed: bool) -> String {
    if needed {
        format!("(?:{body})")
    } else {
        body
    }
}

fn render_class(bytes: &[u8]) -> String {
    if bytes.len() == ALPHABET {
        return "(?s:.)".to_owned();
    }
    if let [b] = bytes {
        return escape_byte(*b);
    }
    // Wide classes read better complemented.
    if bytes.len() >= ALPHABET / 2 {
        let complement: Vec<u8> = (0..ALPHABET as u16)
            .map(|b| b as u8)
            .filter(|b| !bytes.contains(b))
            .collect();
        return format!("[^{}]", class_items(&complement));
    }
    format!("[{}]", class_items(bytes))
}

fn class_items(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        let mut j = i;
        while j + 1 < bytes.len() && bytes[j + 1] == bytes[j] + 1 {
            j += 1;
        }
        match j - i {
            0 => out.push_str(&class_byte(bytes[i])),
            1 => {
                out.push_str(&class_byte(bytes[i]));
                out.push_str(&class_byte(bytes[j]));
            }
            _ => {
                out.push_str(&class_byte(bytes[i]));
                out.push('-');
                out.push_str(&class_byte(bytes[j]));
            }
        }
        i = j + 1;
    }
    out
}

fn class_byte(b: u8) -> String {
    match b {
        b'[' | b']' | b'^' | b'-' | b'\\' | b'&' | b'~' => format!("\\{}", b as char),
        0x20..=0x7e => (b as char).to_string(),
        _ => format!("\\x{b:02X}"),
    }
}

fn escape_byte(b: u8) -> String {
    let c = b as char;
    if (0x20..=0x7e).contains(&b) {
        if regex_syntax::is_meta_character(c) {
            format!("\\{c}")
        } else {
            c.to_string()
        }
    } else {
        format!("\\x{b:02X}")
    }
}

#[cfg(test)]
mod tests {
    use crate::fsm::Fsm;

    #[test]
    fn literal_stays_readable() {
        let f = Fsm::from_regex("d0dc1").unwrap();
        assert_eq!(f.to_regex(), "d0dc1");
    }

    #[test]
    fn class_compresses_to_range() {
        let f = Fsm::from_regex("d[0-2]dc1").unwrap();
        assert_eq!(f.to_regex(), "d[0-2]dc1");
    }

    #[test]
    fn empty_language_renders_unmatchable() {
        let a = Fsm::from_regex("d0dc1").unwrap();
        let b = Fsm::from_regex("d1dc1").unwrap();
        let none = a.intersect(&b);
        let re = Fsm::from_regex(&none.to_regex()).unwrap();
        assert!(re.is_empty_language());
    }
}
