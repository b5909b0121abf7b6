// Marlais Printer - Value Output
//
// Readable rendering for the REPL and condition messages, plus the
// `format-out` directive subset.

use crate::context::GlobalContext;
use crate::types::Value;

/// Print options
#[derive(Debug, Clone)]
pub struct PrintOptions {
    /// Print readably (quote strings and characters)
    pub escape: bool,
    /// Maximum depth to print
    pub max_depth: usize,
    /// Maximum list length to print
    pub max_length: usize,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            escape: true,
            max_depth: 100,
            max_length: 1000,
        }
    }
}

impl PrintOptions {
    /// Readable output
    pub fn readable() -> Self {
        Self::default()
    }

    /// Human-readable output
    pub fn display() -> Self {
        Self {
            escape: false,
            ..Self::default()
        }
    }
}

pub struct Printer<'a> {
    globals: &'a GlobalContext,
    output: String,
    options: PrintOptions,
    current_depth: usize,
}

impl<'a> Printer<'a> {
    pub fn new(globals: &'a GlobalContext, options: PrintOptions) -> Self {
        Self {
            globals,
            output: String::new(),
            options,
            current_depth: 0,
        }
    }

    pub fn print(&mut self, value: &Value) -> &str {
        self.print_value(value);
        &self.output
    }

    fn print_value(&mut self, value: &Value) {
        if self.current_depth > self.options.max_depth {
            self.output.push_str("...");
            return;
        }
        self.current_depth += 1;

        let mop = &self.globals.mop;
        match value {
            Value::Boolean(true) => self.output.push_str("#t"),
            Value::Boolean(false) => self.output.push_str("#f"),
            Value::EmptyList => self.output.push_str("()"),
            Value::Eof => self.output.push_str("#eof"),
            Value::Unspecified => self.output.push_str("{unspecified}"),
            Value::Uninitialized => self.output.push_str("{uninitialized}"),
            Value::Character(c) => {
                if self.options.escape {
                    match c {
                        ' ' => self.output.push_str("#\\space"),
                        '\n' => self.output.push_str("#\\newline"),
                        '\t' => self.output.push_str("#\\tab"),
                        c => {
                            self.output.push_str("#\\");
                            self.output.push(*c);
                        }
                    }
                } else {
                    self.output.push(*c);
                }
            }
            Value::Integer(n) => self.output.push_str(&n.to_string()),
            Value::Float(f) => self.output.push_str(&format!("{:?}", f)),
            Value::Name(sym) => self.output.push_str(&self.globals.name(*sym)),
            Value::Symbol(sym) => {
                let name = self.globals.name(*sym);
                if self.options.escape {
                    self.output.push_str(&format!("#\"{}\"", name));
                } else {
                    self.output.push_str(&name);
                }
            }
            Value::String(s) => {
                let s = s.borrow().clone();
                self.print_string(&s);
            }
            Value::Pair(_) => self.print_list(value),
            Value::Vector(items) => {
                let items = items.borrow().clone();
                self.output.push_str("#(");
                self.print_sequence(&items, " ");
                self.output.push(')');
            }
            Value::Table(entries) => {
                let count = entries.borrow().len();
                self.output.push_str(&format!("{{table of {} entries}}", count));
            }
            Value::ByteVector(bytes) => {
                let rendered: Vec<String> = bytes.borrow().iter().map(u8::to_string).collect();
                self.output.push_str(&format!("{{byte-vector {}}}", rendered.join(" ")));
            }
            Value::Class(c) => self.output.push_str(&format!("{{class {}}}", mop.class_name(*c))),
            Value::Singleton(_)
            | Value::Subclass(_)
            | Value::LimitedInteger(_)
            | Value::Union(_) => self.output.push_str(&format!("{{type {}}}", mop.type_name(value))),
            Value::SlotDescriptor(class, index) => {
                let name = mop
                    .get_class(*class)
                    .and_then(|c| c.slots.get(*index as usize))
                    .map(|s| self.globals.name(s.name))
                    .unwrap_or_else(|| index.to_string());
                self.output.push_str(&format!("{{slot {} of {}}}", name, mop.class_name(*class)));
            }
            Value::Primitive(p) => {
                self.output.push_str(&format!("{{primitive {}}}", self.globals.name(p.name)))
            }
            Value::Generic(_) => self.output.push_str(&format!("{{generic {}}}", mop.describe_value(value))),
            Value::Method(m) => match m.name {
                Some(name) => self.output.push_str(&format!("{{method {}}}", self.globals.name(name))),
                None => self.output.push_str("{method}"),
            },
            Value::NextMethod(_) => self.output.push_str("{next-method}"),
            Value::Exit(tag) => self.output.push_str(&format!("{{exit procedure {}}}", tag)),
            Value::Values(items) => {
                let items = items.to_vec();
                self.print_sequence(&items, ", ");
            }
            Value::Instance(inst) => {
                if mop.is_subclass(inst.class, mop.builtin.condition) {
                    let message = condition_message(self.globals, value);
                    self.output
                        .push_str(&format!("{{{} {}}}", mop.class_name(inst.class), message));
                } else {
                    self.output
                        .push_str(&format!("{{instance of {}}}", mop.class_name(inst.class)));
                }
            }
            Value::Module(id) => {
                let name = self
                    .globals
                    .modules
                    .get(*id)
                    .map(|m| self.globals.name(m.name))
                    .unwrap_or_default();
                self.output.push_str(&format!("{{module {}}}", name));
            }
            Value::Environment(_) => self.output.push_str("{environment}"),
            Value::Condition(c) => {
                let class = mop.condition_class(c);
                self.output
                    .push_str(&format!("{{{} {}}}", mop.class_name(class), c.message));
            }
        }

        self.current_depth -= 1;
    }

    fn print_string(&mut self, s: &str) {
        if !self.options.escape {
            self.output.push_str(s);
            return;
        }
        self.output.push('"');
        for c in s.chars() {
            match c {
                '"' | '\\' => {
                    self.output.push('\\');
                    self.output.push(c);
                }
                '\n' => self.output.push_str("\\n"),
                '\t' => self.output.push_str("\\t"),
                c => self.output.push(c),
            }
        }
        self.output.push('"');
    }

    fn print_sequence(&mut self, items: &[Value], separator: &str) {
        for (i, item) in items.iter().enumerate() {
            if i >= self.options.max_length {
                self.output.push_str(" ...");
                break;
            }
            if i > 0 {
                self.output.push_str(separator);
            }
            self.print_value(item);
        }
    }

    fn print_list(&mut self, list: &Value) {
        self.output.push('(');
        let mut current = list.clone();
        let mut count = 0;
        loop {
            if count >= self.options.max_length {
                self.output.push_str(" ...");
                break;
            }
            match current {
                Value::Pair(pair) => {
                    if count > 0 {
                        self.output.push(' ');
                    }
                    let head = pair.head.borrow().clone();
                    self.print_value(&head);
                    current = pair.tail.borrow().clone();
                    count += 1;
                }
                Value::EmptyList => break,
                other => {
                    // Improper list
                    self.output.push_str(" . ");
                    self.print_value(&other);
                    break;
                }
            }
        }
        self.output.push(')');
    }
}

/// Readable rendering
pub fn print_to_string(globals: &GlobalContext, value: &Value) -> String {
    let mut printer = Printer::new(globals, PrintOptions::readable());
    printer.print(value).to_string()
}

/// Rendering without quotes or escapes
pub fn display_to_string(globals: &GlobalContext, value: &Value) -> String {
    let mut printer = Printer::new(globals, PrintOptions::display());
    printer.print(value).to_string()
}

/// Message of a condition object: the `message` slot of a condition
/// instance, or the text of a runtime condition
pub fn condition_message(globals: &GlobalContext, value: &Value) -> String {
    match value {
        Value::Condition(c) => c.message.clone(),
        Value::Instance(_) => globals
            .symbols
            .find("message")
            .and_then(|message| globals.mop.slot_by_name(value, message))
            .filter(|m| !matches!(m, Value::Uninitialized))
            .map(|m| display_to_string(globals, &m))
            .unwrap_or_default(),
        other => display_to_string(globals, other),
    }
}

/// `format-out` directives: `%s` and `%d` display, `%=` prints readably,
/// `%%` is a literal percent.
pub fn format(globals: &GlobalContext, control: &str, args: &[Value]) -> String {
    let mut output = String::new();
    let mut chars = control.chars();
    let mut args = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        match chars.next() {
            Some('s') | Some('S') | Some('d') | Some('D') => {
                if let Some(arg) = args.next() {
                    output.push_str(&display_to_string(globals, arg));
                }
            }
            Some('=') => {
                if let Some(arg) = args.next() {
                    output.push_str(&print_to_string(globals, arg));
                }
            }
            Some('%') => output.push('%'),
            Some(other) => {
                // Unknown directive, copy literally
                output.push('%');
                output.push(other);
            }
            None => output.push('%'),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_atoms() {
        let globals = GlobalContext::new().unwrap();
        assert_eq!(print_to_string(&globals, &Value::Integer(-3)), "-3");
        assert_eq!(print_to_string(&globals, &Value::Float(1.0)), "1.0");
        assert_eq!(print_to_string(&globals, &Value::Boolean(false)), "#f");
        assert_eq!(print_to_string(&globals, &Value::Character(' ')), "#\\space");
        assert_eq!(print_to_string(&globals, &Value::string("a\"b")), "\"a\\\"b\"");
        assert_eq!(display_to_string(&globals, &Value::string("a\"b")), "a\"b");
    }

    #[test]
    fn test_print_lists_and_objects() {
        let mut globals = GlobalContext::new().unwrap();
        let sym = globals.symbols.intern("red");
        let list = Value::list_with_tail(
            vec![Value::Integer(1), Value::Symbol(sym)],
            Value::Integer(2),
        );
        assert_eq!(print_to_string(&globals, &list), "(1 #\"red\" . 2)");
        let integer = Value::Class(globals.mop.builtin.integer);
        assert_eq!(print_to_string(&globals, &integer), "{class <integer>}");
        let vector = Value::vector(vec![Value::Integer(1), Value::EmptyList]);
        assert_eq!(print_to_string(&globals, &vector), "#(1 ())");
    }

    #[test]
    fn test_format_directives() {
        let globals = GlobalContext::new().unwrap();
        let args = [Value::string("x"), Value::string("y"), Value::Integer(5)];
        assert_eq!(format(&globals, "%s %= %d%%", &args), "x \"y\" 5%");
    }
}
