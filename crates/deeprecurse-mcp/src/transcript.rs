#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Splits a raw transcript into turns. A line starting with `USER:` or
/// `ASSISTANT:` opens a turn; following lines belong to it until the next
/// marker. Text before the first marker is not part of any turn.
pub fn parse_transcript(text: &str) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut current: Option<(Role, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some((role, rest)) = turn_marker(line) {
            if let Some((role, lines)) = current.take() {
                turns.push(finish_turn(role, &lines));
            }
            current = Some((role, vec![rest.trim_start()]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((role, lines)) = current {
        turns.push(finish_turn(role, &lines));
    }
    turns
}

fn turn_marker(line: &str) -> Option<(Role, &str)> {
    [Role::User, Role::Assistant].into_iter().find_map(|role| {
        line.strip_prefix(role.label())
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|rest| (role, rest))
    })
}

fn finish_turn(role: Role, lines: &[&str]) -> Turn {
    Turn {
        role,
        content: lines.join("\n").trim().to_string(),
    }
}
