//! Declaration search over IR text.
//!
//! Works on raw source lines, so it also finds declarations in files that do
//! not parse as a whole.

use super::parser::tokenize;

/// Locate `func` and `global` declarations named `qualified_name`.
///
/// The name is either bare (`add`, matched in any module) or qualified with
/// the module path (`n::m::add`). Positions are 1-based `(line, column)`
/// pairs pointing at the first token of the declaration.
pub fn find_declarations(source: &str, qualified_name: &str) -> Vec<(usize, usize)> {
    let (module_path, name) = match qualified_name.rsplit_once("::") {
        Some((module, name)) => (Some(module), name),
        None => (None, qualified_name),
    };

    let mut current_module: Option<String> = None;
    let mut found = Vec::new();

    for (idx, line) in source.lines().enumerate() {
        let tokens = tokenize(line);
        let Some(first) = tokens.first() else {
            continue;
        };

        if first.text == "module" {
            current_module = tokens.get(1).map(|t| t.text.to_string());
            continue;
        }

        let declared = match first.text {
            "global" => tokens[1..]
                .iter()
                .find(|t| t.text != "export" && t.text != "mut"),
            "export" | "func" => {
                let skip = usize::from(first.text == "export");
                match tokens.get(skip) {
                    Some(t) if t.text == "func" => tokens.get(skip + 1),
                    _ => None,
                }
            }
            _ => None,
        };

        let Some(declared) = declared else {
            continue;
        };
        if declared.text != name {
            continue;
        }
        if let Some(path) = module_path
            && current_module.as_deref() != Some(path)
        {
            continue;
        }
        found.push((idx + 1, first.column));
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
module n::m
export func C(a) {
  arg a
  ret
}
global C2 = 1

module other
  func C() {
    const 0
    ret
  }
global export mut C = 7
";

    #[test]
    fn test_qualified_name() {
        assert_eq!(find_declarations(SOURCE, "n::m::C"), vec![(2, 1)]);
        assert_eq!(find_declarations(SOURCE, "other::C"), vec![(9, 3), (13, 1)]);
    }

    #[test]
    fn test_bare_name_matches_every_module() {
        assert_eq!(find_declarations(SOURCE, "C"), vec![(2, 1), (9, 3), (13, 1)]);
        assert_eq!(find_declarations(SOURCE, "C2"), vec![(6, 1)]);
    }

    #[test]
    fn test_no_match() {
        assert!(find_declarations(SOURCE, "n::m::D").is_empty());
        assert!(find_declarations(SOURCE, "x::C").is_empty());
        // Instructions that mention a name are not declarations
        assert!(find_declarations("module m\nfunc f() {\n  call C 0\n  ret\n}\n", "C").is_empty());
    }
}
