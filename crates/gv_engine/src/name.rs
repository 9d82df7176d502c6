//! The stable type-key grammar.
//!
//! ```text
//! typeKey := arrayOf | generic | simple
//! arrayOf := typeKey '[' ','* ']'          // rank = 1 + number of commas
//! generic := simpleBase '<' typeKey (',' typeKey)* '>'
//! ```
//!
//! Keys are canonical and assembly-independent; the same graph produced
//! on two silos names its types identically.

use core::fmt;

use crate::error::{SerialError, SerialResult};

// -----------------------------------------------------------------------------
// TypeName

/// A parsed type key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeName {
    /// An opaque name containing no structure characters.
    Simple(String),
    /// A closed generic: `base<arg, ...>`.
    Generic { base: String, args: Vec<TypeName> },
    /// An array of the given rank: `elem[]`, `elem[,]`, ...
    Array { elem: Box<TypeName>, rank: usize },
}

impl TypeName {
    /// Parses a type key, failing with
    /// [`SerialError::UnresolvableTypeName`] on anything outside the
    /// grammar.
    pub fn parse(key: &str) -> SerialResult<TypeName> {
        let malformed = || SerialError::UnresolvableTypeName { key: key.into() };

        let key = key.trim();
        if key.is_empty() {
            return Err(malformed());
        }

        // Arrays bind last: `list<int>[]` is an array of generics.
        if let Some(stripped) = key.strip_suffix(']') {
            let open = stripped.rfind('[').ok_or_else(malformed)?;
            let (base, commas) = stripped.split_at(open);
            let commas = &commas[1..];
            if base.is_empty() || !commas.chars().all(|c| c == ',') {
                return Err(malformed());
            }
            return Ok(TypeName::Array {
                elem: Box::new(TypeName::parse(base)?),
                rank: 1 + commas.len(),
            });
        }

        if let Some(open) = key.find('<') {
            let (base, rest) = key.split_at(open);
            let inner = rest
                .strip_prefix('<')
                .and_then(|r| r.strip_suffix('>'))
                .ok_or_else(malformed)?;
            if base.is_empty() || !is_simple(base) {
                return Err(malformed());
            }
            let args = split_top_level(inner)
                .ok_or_else(malformed)?
                .into_iter()
                .map(TypeName::parse)
                .collect::<SerialResult<Vec<_>>>()?;
            if args.is_empty() {
                return Err(malformed());
            }
            return Ok(TypeName::Generic {
                base: base.to_string(),
                args,
            });
        }

        if !is_simple(key) {
            return Err(malformed());
        }
        Ok(TypeName::Simple(key.to_string()))
    }

    /// The alternative lookup key of a generic definition: `base<arity>`,
    /// written `` base`2 ``.
    pub fn definition_key(&self) -> Option<String> {
        match self {
            TypeName::Generic { base, args } => Some(format!("{base}`{}", args.len())),
            _ => None,
        }
    }

    /// The rank of the outermost array, if this is one.
    pub fn rank(&self) -> Option<usize> {
        match self {
            TypeName::Array { rank, .. } => Some(*rank),
            _ => None,
        }
    }
}

fn is_simple(s: &str) -> bool {
    !s.is_empty() && !s.contains(['<', '>', '[', ']', ','])
}

/// Slices `inner` at top-level commas, tracking bracket depth.
///
/// Returns `None` when brackets are unbalanced or a slice is empty.
fn split_top_level(inner: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0_usize;

    for (i, c) in inner.char_indices() {
        match c {
            '<' | '[' => depth += 1,
            '>' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            ',' if depth == 0 => {
                parts.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(inner[start..].trim());

    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

/// The canonical rendering: what goes into type headers and registry
/// indexes.
impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeName::Simple(name) => f.write_str(name),
            TypeName::Generic { base, args } => {
                write!(f, "{base}<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")
            }
            TypeName::Array { elem, rank } => {
                write!(f, "{elem}[")?;
                for _ in 1..*rank {
                    f.write_str(",")?;
                }
                f.write_str("]")
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::TypeName;
    use crate::error::SerialError;

    fn parse(key: &str) -> TypeName {
        TypeName::parse(key).unwrap()
    }

    #[test]
    fn simple_names() {
        assert_eq!(parse("int"), TypeName::Simple("int".into()));
        assert_eq!(parse("my.module.Widget"), TypeName::Simple("my.module.Widget".into()));
    }

    #[test]
    fn nested_generics() {
        let name = parse("list<map<int,string>>");
        assert_eq!(
            name,
            TypeName::Generic {
                base: "list".into(),
                args: vec![TypeName::Generic {
                    base: "map".into(),
                    args: vec![
                        TypeName::Simple("int".into()),
                        TypeName::Simple("string".into()),
                    ],
                }],
            }
        );
        assert_eq!(name.definition_key().unwrap(), "list`1");
        assert_eq!(name.to_string(), "list<map<int,string>>");
    }

    #[test]
    fn array_ranks() {
        assert_eq!(
            parse("Foo[,,]"),
            TypeName::Array {
                elem: Box::new(TypeName::Simple("Foo".into())),
                rank: 3,
            }
        );
        assert_eq!(parse("int[]").rank(), Some(1));
        assert_eq!(parse("int[][]").to_string(), "int[][]");
    }

    #[test]
    fn arrays_of_generics() {
        let name = parse("list<int>[,]");
        assert_eq!(
            name,
            TypeName::Array {
                elem: Box::new(TypeName::Generic {
                    base: "list".into(),
                    args: vec![TypeName::Simple("int".into())],
                }),
                rank: 2,
            }
        );
        assert_eq!(name.to_string(), "list<int>[,]");
    }

    #[test]
    fn generic_commas_split_at_top_level_only() {
        let name = parse("map<list<map<int,string>>,guid>");
        let TypeName::Generic { base, args } = &name else {
            panic!("expected a generic");
        };
        assert_eq!(base, "map");
        assert_eq!(args.len(), 2);
        assert_eq!(args[1], TypeName::Simple("guid".into()));
    }

    #[test]
    fn malformed_keys() {
        for key in [
            "", "<", ">", "[]", "foo<", "foo>", "foo<>", "foo<int",
            "foo<int,>", "foo[", "foo[x]", "foo]", "<int>", "foo<,int>",
            "foo<int>>",
        ] {
            match TypeName::parse(key) {
                Err(SerialError::UnresolvableTypeName { key: k }) => assert_eq!(k, key),
                other => panic!("`{key}` parsed as {other:?}"),
            }
        }
    }
}
