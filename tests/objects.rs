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

fn ints(items: &[i64]) -> Value {
    Value::list(items.iter().map(|n| Value::Integer(*n)).collect())
}

const POINT: &str = "(define-class <point> (<object>)
                       (slot x <integer> init-keyword: x: init-value: 0)
                       (slot y <integer> init-keyword: y: init-function: (method () 7)))";

#[test]
fn slots_take_keywords_then_defaults() {
    let source = format!(
        "{} (define-variable p (make <point> x: 3))
            (define-variable q (make <point>))
            (list (x p) (y p) (x q) (y q))",
        POINT
    );
    assert_eq!(run(&source).unwrap(), ints(&[3, 7, 0, 7]));
}

#[test]
fn slot_types_are_enforced() {
    let at_make = format!("{} (make <point> x: \"three\")", POINT);
    assert!(matches!(error_of(run(&at_make)), RuntimeError::TypeCheck { .. }));

    let at_set = format!("{} (define-variable p (make <point>)) (:= (x p) 'left)", POINT);
    assert!(matches!(error_of(run(&at_set)), RuntimeError::TypeCheck { .. }));
}

#[test]
fn required_init_keyword_must_be_supplied() {
    let source = "(define-class <person> (<object>)
                    (slot name required-init-keyword: name:))
                  (make <person>)";
    assert!(matches!(error_of(run(source)), RuntimeError::MissingInitKeyword { .. }));

    let supplied = "(define-class <person> (<object>)
                      (slot name required-init-keyword: name:))
                    (name (make <person> name: \"Ada\"))";
    assert_eq!(run(supplied).unwrap(), Value::string("Ada"));
}

#[test]
fn reading_an_uninitialized_slot_fails() {
    let source = "(define-class <box> (<object>) (slot contents))
                  (contents (make <box>))";
    assert!(matches!(error_of(run(source)), RuntimeError::SlotNotInitialized { .. }));
}

#[test]
fn subclasses_inherit_slots_and_accessors() {
    let source = format!(
        "{} (define-class <point3> (<point>) (slot z init-keyword: z: init-value: 0))
            (define-variable p (make <point3> x: 1 z: 9))
            (:= (y p) 2)
            (list (x p) (y p) (z p))",
        POINT
    );
    assert_eq!(run(&source).unwrap(), ints(&[1, 2, 9]));
}

#[test]
fn class_slots_are_shared() {
    let source = "(define-class <counter> (<object>)
                    (slot total allocation: class init-value: 0))
                  (define-variable a (make <counter>))
                  (define-variable b (make <counter>))
                  (:= (total a) 5)
                  (total b)";
    assert_eq!(run(source).unwrap(), Value::Integer(5));
}

#[test]
fn initialize_runs_after_slots_are_filled() {
    let source = format!(
        "{} (define-method initialize ((p <point>) #rest initargs)
              (next-method)
              (:= (y p) (+ (x p) 100)))
            (y (make <point> x: 5))",
        POINT
    );
    assert_eq!(run(&source).unwrap(), Value::Integer(105));
}

#[test]
fn abstract_and_builtin_classes_cannot_be_made() {
    assert!(matches!(
        error_of(run("(define-class <shape> (<object>) abstract: #t) (make <shape>)")),
        RuntimeError::AbstractInstantiation(_)
    ));
    assert!(matches!(
        error_of(run("(make <integer>)")),
        RuntimeError::AbstractInstantiation(_)
    ));
}

#[test]
fn instances_answer_type_queries() {
    let source = format!(
        "{} (define-variable p (make <point>))
            (list (instance? p <point>) (instance? p <object>) (instance? 3 <point>)
                  (== (object-class p) <point>))",
        POINT
    );
    assert_eq!(
        run(&source).unwrap(),
        Value::list(vec![
            Value::Boolean(true),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Boolean(true)
        ])
    );
}

#[test]
fn redefined_class_is_a_new_class() {
    let source = "(define-class <thing> (<object>))
                  (define-variable old (make <thing>))
                  (define-class <thing> (<object>))
                  (instance? old <thing>)";
    assert_eq!(run(source).unwrap(), Value::Boolean(false));
}
