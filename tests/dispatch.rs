use marlais::{ControlSignal, EvalResult, GlobalContext, Interpreter, Process, RuntimeError, Value};

fn run(source: &str) -> EvalResult {
    let mut globals = GlobalContext::new().unwrap();
    let mut process = Process::new(globals.user_module);
    Interpreter::new(&mut process, &mut globals).eval_string(source)
}

fn error_of(result: EvalResult) -> RuntimeError {
    match result {
        Err(ControlSignal::Error(condition)) => condition.error.clone().expect("runtime error"),
        other => panic!("expected an error, got {:?}", other.map_err(|_| ())),
    }
}

fn strings(items: &[&str]) -> Value {
    Value::list(items.iter().map(|s| Value::string(s)).collect())
}

#[test]
fn next_method_walks_to_less_specific_methods() {
    let source = "(define-method describe ((n <object>)) (list \"object\"))
                  (define-method describe ((n <number>)) (pair \"number\" (next-method)))
                  (define-method describe ((n <integer>)) (pair \"integer\" (next-method)))
                  (describe 3)";
    assert_eq!(run(source).unwrap(), strings(&["integer", "number", "object"]));

    let floats = "(define-method describe ((n <object>)) (list \"object\"))
                  (define-method describe ((n <number>)) (pair \"number\" (next-method)))
                  (define-method describe ((n <integer>)) (pair \"integer\" (next-method)))
                  (describe 2.5)";
    assert_eq!(run(floats).unwrap(), strings(&["number", "object"]));
}

#[test]
fn next_method_is_false_for_the_last_method() {
    let source = "(define-method only ((x <integer>)) next-method)
                  (only 1)";
    assert_eq!(run(source).unwrap(), Value::Boolean(false));
}

#[test]
fn next_method_can_pass_new_arguments() {
    let source = "(define-method scale ((x <number>)) (* x 10))
                  (define-method scale ((x <integer>)) (next-method (+ x 1)))
                  (scale 1)";
    assert_eq!(run(source).unwrap(), Value::Integer(20));
}

#[test]
fn singleton_beats_class() {
    let source = "(define-method f ((x <integer>)) \"integer\")
                  (define-method f ((x (singleton 0))) \"zero\")
                  (list (f 0) (f 1))";
    assert_eq!(run(source).unwrap(), strings(&["zero", "integer"]));
}

#[test]
fn limited_and_union_specializers() {
    let source = "(define-method size-class ((n <integer>)) \"big\")
                  (define-method size-class ((n (limited <integer> min: 0 max: 9))) \"digit\")
                  (define-method kind ((x (type-union <string> <boolean>))) \"text-or-flag\")
                  (define-method kind ((x <object>)) \"other\")
                  (list (size-class 5) (size-class 50) (kind #t) (kind 1))";
    assert_eq!(run(source).unwrap(), strings(&["digit", "big", "text-or-flag", "other"]));
}

#[test]
fn class_precedence_orders_diamond_methods() {
    let classes = "(define-class <a> (<object>))
                   (define-class <b> (<a>))
                   (define-class <c> (<a>))
                   (define-class <d> (<b> <c>))";
    let source = format!(
        "{}
         (define-method who ((x <a>)) \"a\")
         (define-method who ((x <c>)) \"c\")
         (define-method who ((x <b>)) \"b\")
         (list (who (make <d>)) (who (make <c>)))",
        classes
    );
    assert_eq!(run(&source).unwrap(), strings(&["b", "c"]));

    let cpl = format!("{} (= (all-superclasses <d>) (list <d> <b> <c> <a> <object>))", classes);
    assert_eq!(run(&cpl).unwrap(), Value::Boolean(true));
}

#[test]
fn inconsistent_precedence_is_rejected() {
    let source = "(define-class <x> (<object>))
                  (define-class <y> (<x>))
                  (define-class <z> (<x> <y>))";
    assert!(matches!(error_of(run(source)), RuntimeError::InconsistentPrecedence(_)));
}

#[test]
fn adding_a_method_invalidates_the_cache() {
    let source = "(define-method g ((x <object>)) \"object\")
                  (define-variable before (g 1))
                  (define-method g ((x <integer>)) \"integer\")
                  (list before (g 1))";
    assert_eq!(run(source).unwrap(), strings(&["object", "integer"]));
}

#[test]
fn redefining_a_method_replaces_it() {
    let source = "(define-method h ((x <integer>)) 1)
                  (h 0)
                  (define-method h ((x <integer>)) 2)
                  (list (h 0) (size (generic-function-methods h)))";
    assert_eq!(run(source).unwrap(), Value::list(vec![Value::Integer(2), Value::Integer(1)]));
}

#[test]
fn dispatch_failures() {
    assert!(matches!(
        error_of(run("(define-method only-int ((x <integer>)) x) (only-int \"s\")")),
        RuntimeError::NoApplicableMethod { .. }
    ));
    assert!(matches!(
        error_of(run("(define-method two ((a <integer>) (b <integer>)) a) (two 1)")),
        RuntimeError::Arity { .. }
    ));
}

#[test]
fn sorted_applicable_methods_lists_most_specific_first() {
    let source = "(define-method k ((x <object>)) 1)
                  (define-method k ((x <integer>)) 2)
                  (define-method k ((x <string>)) 3)
                  (map-first (sorted-applicable-methods k 5))";
    let prelude = "(define-method map-first (methods) (if (empty? methods) #f ((head methods) 0)))";
    assert_eq!(run(&format!("{} {}", prelude, source)).unwrap(), Value::Integer(2));
    assert_eq!(
        run("(define-method k ((x <integer>)) 2) (sorted-applicable-methods k \"s\")").unwrap(),
        Value::EmptyList
    );
}

#[test]
fn subclass_specializers_check_every_class_argument() {
    let source = "(define-method kind ((c (subclass <number>))) \"number-class\")
                  (define-method kind ((c <object>)) \"other\")
                  (list (kind <integer>) (kind <string>))";
    assert_eq!(run(source).unwrap(), strings(&["number-class", "other"]));

    let only = "(define-method only ((c (subclass <number>))) 1)
                (only <integer>)
                (only <string>)";
    assert!(matches!(error_of(run(only)), RuntimeError::NoApplicableMethod { .. }));
}
