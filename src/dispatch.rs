// Marlais Generic Dispatch
//
// Applicable-method selection, specificity ordering and the per-generic
// cache keyed by the classes of the required arguments.

use crate::clos::{ClassId, GenericId, Method, MetaObjectProtocol};
use crate::conditions::RuntimeError;
use crate::types::Value;
use log::trace;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::rc::Rc;

/// Classes of the required arguments of one call
pub type DispatchKey = SmallVec<[ClassId; 4]>;

/// Sort key of one specializer against one argument; smaller is more specific.
/// (CPL position + 1, tier, tie-breaker); singletons rank (0, 0, 0).
type Rank = (usize, u8, usize);

impl MetaObjectProtocol {
    /// Sorted applicable methods for a call, most specific first.
    ///
    /// Signals an arity error for a wrong argument count and
    /// `NoApplicableMethod` when nothing applies.
    pub fn sorted_applicable_methods(
        &mut self,
        id: GenericId,
        args: &[Value],
    ) -> Result<Rc<[Rc<Method>]>, RuntimeError> {
        let generic = self.generic(id)?;
        let required = generic.required;
        let accepts_more = generic.rest || generic.keys;
        if args.len() < required || (args.len() > required && !accepts_more) {
            return Err(RuntimeError::Arity {
                callee: generic.display_name.clone(),
                expected: if accepts_more {
                    format!("at least {}", required)
                } else {
                    required.to_string()
                },
                got: args.len(),
            });
        }

        let required_args = &args[..required];
        let key: DispatchKey = required_args.iter().map(|a| self.class_of(a)).collect();
        let use_cache = !generic.value_dispatch;
        if use_cache {
            if let Some(hit) = generic.method_cache.get(&key) {
                trace!("dispatch cache hit for {} on {:?}", generic.display_name, key);
                return Ok(hit.clone());
            }
        }
        trace!("dispatch cache miss for {} on {:?}", generic.display_name, key);

        let applicable = self.compute_applicable_methods(id, required_args);
        if applicable.is_empty() {
            let classes: Vec<&str> = key.iter().map(|c| self.class_name(*c)).collect();
            return Err(RuntimeError::NoApplicableMethod {
                generic: self
                    .get_generic(id)
                    .map(|g| g.display_name.clone())
                    .unwrap_or_default(),
                classes: classes.join(", "),
            });
        }
        let sorted: Rc<[Rc<Method>]> = applicable.into();
        if use_cache {
            self.generic_mut(id)?.method_cache.insert(key, sorted.clone());
        }
        Ok(sorted)
    }

    /// Applicable methods sorted by specificity; empty when none applies
    pub fn compute_applicable_methods(&self, id: GenericId, args: &[Value]) -> Vec<Rc<Method>> {
        let mut applicable: Vec<Rc<Method>> = self
            .generic_methods(id)
            .iter()
            .filter(|m| self.method_applicable(m, args))
            .cloned()
            .collect();
        // Stable sort: total ties keep definition order
        applicable.sort_by(|a, b| self.compare_method_specificity(a, b, args));
        applicable
    }

    pub fn method_applicable(&self, method: &Method, args: &[Value]) -> bool {
        method.specializers.len() <= args.len()
            && method
                .specializers
                .iter()
                .zip(args.iter())
                .all(|(spec, arg)| self.instance_of(arg, spec))
    }

    fn compare_method_specificity(&self, a: &Method, b: &Method, args: &[Value]) -> Ordering {
        for (i, arg) in args.iter().enumerate() {
            let (Some(sa), Some(sb)) = (a.specializers.get(i), b.specializers.get(i)) else {
                continue;
            };
            let ra = self.specializer_rank(sa, arg);
            let rb = self.specializer_rank(sb, arg);
            if ra != rb {
                return ra.cmp(&rb);
            }
        }
        Ordering::Equal
    }

    fn specializer_rank(&self, spec: &Value, arg: &Value) -> Rank {
        let cpl = self.cpl(self.class_of(arg));
        let position = |c: ClassId| {
            cpl.iter()
                .position(|k| *k == c)
                .map_or(usize::MAX, |p| p + 1)
        };
        match spec {
            Value::Singleton(_) => (0, 0, 0),
            Value::LimitedInteger(l) => (position(l.base), 0, 0),
            Value::Subclass(c) => {
                // Ordered among themselves by the argument class's own CPL
                let inner = match arg {
                    Value::Class(k) => self
                        .cpl(*k)
                        .iter()
                        .position(|x| x == c)
                        .unwrap_or(usize::MAX),
                    _ => usize::MAX,
                };
                (position(self.builtin.class), 0, inner)
            }
            Value::Class(c) => (position(*c), 1, 0),
            Value::Union(members) => members
                .iter()
                .filter(|m| self.instance_of(arg, m))
                .map(|m| self.specializer_rank(m, arg))
                .min()
                .unwrap_or((usize::MAX, u8::MAX, usize::MAX)),
            _ => (usize::MAX, u8::MAX, usize::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clos::{ClassFlags, Linearization, MethodBody, ParamList};
    use crate::environment::Environment;
    use crate::module::ModuleId;
    use crate::symbol::SymbolTable;
    use crate::types::LimitedInteger;

    fn method(tag: i64, specializers: Vec<Value>) -> Rc<Method> {
        Rc::new(Method {
            name: None,
            specializers,
            params: ParamList::default(),
            body: MethodBody::Code {
                body: Value::Integer(tag),
                env: Environment::module_root(ModuleId(0)),
            },
        })
    }

    fn tag_of(m: &Method) -> i64 {
        match &m.body {
            MethodBody::Code { body: Value::Integer(n), .. } => *n,
            _ => -1,
        }
    }

    fn setup() -> (SymbolTable, MetaObjectProtocol, GenericId) {
        let mut symbols = SymbolTable::new();
        let mut mop = MetaObjectProtocol::new(&mut symbols, Linearization::Clos);
        let name = symbols.intern("describe");
        let gf = mop.define_generic(&symbols, name, 1, false, false);
        (symbols, mop, gf)
    }

    #[test]
    fn test_most_specific_first() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        mop.add_method(gf, method(1, vec![Value::Class(b.number)])).unwrap();
        mop.add_method(gf, method(2, vec![Value::Class(b.integer)])).unwrap();
        mop.add_method(gf, method(3, vec![Value::Class(b.object)])).unwrap();

        let sorted = mop.sorted_applicable_methods(gf, &[Value::Integer(5)]).unwrap();
        let tags: Vec<i64> = sorted.iter().map(|m| tag_of(m)).collect();
        assert_eq!(tags, vec![2, 1, 3]);

        let sorted = mop.sorted_applicable_methods(gf, &[Value::Float(0.5)]).unwrap();
        let tags: Vec<i64> = sorted.iter().map(|m| tag_of(m)).collect();
        assert_eq!(tags, vec![1, 3]);
    }

    #[test]
    fn test_singleton_before_limited_before_class() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        let limited = Value::LimitedInteger(LimitedInteger { base: b.integer, min: Some(0), max: Some(9) });
        mop.add_method(gf, method(1, vec![Value::Class(b.integer)])).unwrap();
        mop.add_method(gf, method(2, vec![limited])).unwrap();
        mop.add_method(gf, method(3, vec![Value::singleton(Value::Integer(4))])).unwrap();

        let sorted = mop.sorted_applicable_methods(gf, &[Value::Integer(4)]).unwrap();
        let tags: Vec<i64> = sorted.iter().map(|m| tag_of(m)).collect();
        assert_eq!(tags, vec![3, 2, 1]);

        let sorted = mop.sorted_applicable_methods(gf, &[Value::Integer(40)]).unwrap();
        assert_eq!(sorted.len(), 1);
        assert!(mop.get_generic(gf).unwrap().method_cache.is_empty());
    }

    #[test]
    fn test_no_applicable_method() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        mop.add_method(gf, method(1, vec![Value::Class(b.string)])).unwrap();
        let err = mop.sorted_applicable_methods(gf, &[Value::Integer(1)]).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::NoApplicableMethod {
                generic: "describe".into(),
                classes: "<integer>".into()
            }
        );
        let err = mop.sorted_applicable_methods(gf, &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Arity { got: 0, .. }));
    }

    #[test]
    fn test_cache_invalidated_by_new_method() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        mop.add_method(gf, method(1, vec![Value::Class(b.number)])).unwrap();
        let first = mop.sorted_applicable_methods(gf, &[Value::Integer(1)]).unwrap();
        assert_eq!(tag_of(&first[0]), 1);
        assert_eq!(mop.get_generic(gf).unwrap().method_cache.len(), 1);

        mop.add_method(gf, method(2, vec![Value::Class(b.integer)])).unwrap();
        let second = mop.sorted_applicable_methods(gf, &[Value::Integer(1)]).unwrap();
        assert_eq!(tag_of(&second[0]), 2);
    }

    #[test]
    fn test_new_subclass_clears_cache() {
        let (mut symbols, mut mop, gf) = setup();
        let object = mop.builtin.object;
        let name = symbols.intern("<shape>");
        let shape = mop
            .define_class(&symbols, name, vec![object], vec![], ClassFlags::default())
            .unwrap();
        mop.add_method(gf, method(1, vec![Value::Class(shape)])).unwrap();
        mop.add_method(gf, method(2, vec![Value::Class(object)])).unwrap();
        mop.sorted_applicable_methods(gf, &[Value::Integer(0)]).unwrap();
        assert!(!mop.get_generic(gf).unwrap().method_cache.is_empty());

        let name = symbols.intern("<circle>");
        mop.define_class(&symbols, name, vec![shape], vec![], ClassFlags::default())
            .unwrap();
        assert!(mop.get_generic(gf).unwrap().method_cache.is_empty());
    }

    #[test]
    fn test_redefinition_replaces_method() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        mop.add_method(gf, method(1, vec![Value::Class(b.integer)])).unwrap();
        mop.add_method(gf, method(2, vec![Value::Class(b.integer)])).unwrap();
        assert_eq!(mop.generic_methods(gf).len(), 1);
        let sorted = mop.sorted_applicable_methods(gf, &[Value::Integer(1)]).unwrap();
        assert_eq!(tag_of(&sorted[0]), 2);
    }

    #[test]
    fn test_subclass_specializer_sees_each_class_argument() {
        let (_, mut mop, gf) = setup();
        let b = mop.builtin.clone();
        mop.add_method(gf, method(1, vec![Value::Subclass(b.number)])).unwrap();

        let sorted = mop.sorted_applicable_methods(gf, &[Value::Class(b.integer)]).unwrap();
        assert_eq!(tag_of(&sorted[0]), 1);
        let err = mop.sorted_applicable_methods(gf, &[Value::Class(b.string)]).unwrap_err();
        assert!(matches!(err, RuntimeError::NoApplicableMethod { .. }));
        assert!(mop.get_generic(gf).unwrap().method_cache.is_empty());
    }
}
