//! Declaration scanning: tree forms to entities and HIR.
//!
//! Module-level forms declare entities in the module scope:
//!
//! ```text
//! (fn name (type_params T)? (parameters (: a T) ...) (return_type T)? body...)
//! (obj Name (type_params T)? (extends Parent)? (: field T) ...)
//! (type Name T)
//! (mod name forms...)
//! (pub declaration)
//! (use (:: module ... name|all) alias?)
//! (impl (type_params T)? Target (fn name (parameters self (: a T) ...) ...)...)
//! (declare "namespace" (fn name (parameters ...) (return_type T)?)...)
//! ```
//!
//! Methods of an `impl` are not bound in the module scope; they join the
//! overload set of calls whose first argument has the target type. A bare
//! `self` parameter takes the target type, and the impl's type parameters
//! are prepended to each method's own. Functions in a `declare` block have
//! no body and are supplied by the host under `namespace`.
//!
//! Function bodies are converted to HIR with children allocated before
//! their parents, so each body is one contiguous arena range.

use crate::ast::{Syntax, SyntaxKind};
use crate::context::{Context, PendingImpl, PendingUse};
use crate::entity::{
    AliasDef, EntityId, EntityKind, FnBody, FnDef, ModuleDef, ObjectDef, ParamDecl, ResolveState,
};
use crate::error::CoreError;
use crate::hir::{ExprId, HirExprKind, Literal, MatchCase, MatchExpr, Pattern, TypeExpr};
use crate::scope::{ScopeId, ScopeKind};
use crate::span::SourceLocation;

/// Declares every form of a module body in `scope`.
pub fn scan_module(ctx: &mut Context, scope: ScopeId, forms: &[Syntax]) -> Result<(), CoreError> {
    let mut scanner = Scanner { ctx };
    for form in forms {
        scanner.declare(scope, form, false)?;
    }
    Ok(())
}

/// Creates a named module in `parent` and scans `forms` into it.
pub fn declare_module(
    ctx: &mut Context,
    parent: ScopeId,
    name: &str,
    location: SourceLocation,
) -> Result<(EntityId, ScopeId), CoreError> {
    let scope = ctx.scopes.push(parent, ScopeKind::Module);
    let id = ctx
        .entities
        .alloc(name, location, EntityKind::Module(ModuleDef { scope }));
    ctx.scopes.register(&ctx.entities, parent, id)?;
    Ok((id, scope))
}

/// Binds every recorded `use` form. Runs after all modules are scanned.
#[tracing::instrument(level = "debug", skip_all, fields(uses = ctx.pending_uses.len()))]
pub fn bind_imports(ctx: &mut Context) -> Result<(), CoreError> {
    for import in std::mem::take(&mut ctx.pending_uses) {
        bind_import(ctx, &import)?;
    }
    Ok(())
}

fn bind_import(ctx: &mut Context, import: &PendingUse) -> Result<(), CoreError> {
    let unresolved = |name: &str| CoreError::UnresolvedIdentifier {
        name: name.to_string(),
        location: import.location.clone(),
    };
    let (first, rest) = import
        .path
        .split_first()
        .ok_or_else(|| unresolved("use"))?;
    let Some((last, modules)) = rest.split_last() else {
        // `(use name)` brings a visible module into scope under an alias.
        let module = ctx
            .scopes
            .resolve(&ctx.entities, import.scope, first)
            .filter(|id| ctx.entities.get(*id).as_module().is_some())
            .ok_or_else(|| unresolved(first))?;
        let alias = import.alias.as_deref().unwrap_or(first);
        return ctx
            .scopes
            .register_as(&ctx.entities, import.scope, alias, module, &import.location);
    };

    let mut module = ctx
        .scopes
        .resolve(&ctx.entities, import.scope, first)
        .and_then(|id| ctx.entities.get(id).as_module())
        .map(|def| def.scope)
        .ok_or_else(|| unresolved(first))?;
    for segment in modules {
        module = ctx
            .scopes
            .exported(&ctx.entities, module, segment)
            .into_iter()
            .find_map(|id| ctx.entities.get(id).as_module().map(|def| def.scope))
            .ok_or_else(|| unresolved(segment))?;
    }

    let imported = if last == "all" {
        ctx.scopes.exports(module).to_vec()
    } else {
        ctx.scopes.exported(&ctx.entities, module, last)
    };
    if imported.is_empty() && last != "all" {
        return Err(unresolved(last));
    }
    for id in imported {
        let name = match (&import.alias, last.as_str()) {
            (Some(alias), name) if name != "all" => alias.clone(),
            _ => ctx.entities.get(id).name.clone(),
        };
        ctx.scopes
            .register_as(&ctx.entities, import.scope, &name, id, &import.location)?;
    }
    tracing::trace!(path = %import.path.join("::"), "bound import");
    Ok(())
}

struct Scanner<'a> {
    ctx: &'a mut Context,
}

struct FnHeader<'f> {
    name: &'f str,
    type_params: Vec<String>,
    params: Vec<ParamDecl>,
    return_expr: Option<TypeExpr>,
    body: &'f [Syntax],
}

impl Scanner<'_> {
    fn declare(&mut self, scope: ScopeId, form: &Syntax, exported: bool) -> Result<(), CoreError> {
        let id = match form.head() {
            Some("fn") => self.declare_fn(scope, form)?,
            Some("obj") => self.declare_obj(scope, form)?,
            Some("type") => self.declare_alias(scope, form)?,
            Some("mod") => {
                let name = self.decl_name(form, "mod")?;
                let (id, inner) = declare_module(self.ctx, scope, name, form.location.clone())?;
                for item in &form.tail()[1..] {
                    self.declare(inner, item, false)?;
                }
                if exported {
                    self.ctx.scopes.export(scope, id);
                }
                return Ok(());
            }
            Some("pub") => {
                let [inner] = form.tail() else {
                    return Err(CoreError::semantic(
                        "pub takes exactly one declaration",
                        &form.location,
                    ));
                };
                if ["use", "pub", "impl", "declare"].iter().any(|kw| inner.is_call(kw)) {
                    return Err(CoreError::semantic(
                        "only fn, obj, type and mod declarations can be exported",
                        &inner.location,
                    ));
                }
                return self.declare(scope, inner, true);
            }
            Some("use") => return self.declare_use(scope, form),
            Some("impl") => return self.declare_impl(scope, form),
            Some("declare") => {
                let namespace = form.tail().first().and_then(Syntax::string).ok_or_else(|| {
                    CoreError::semantic("declare requires a quoted namespace", &form.location)
                })?;
                for item in &form.tail()[1..] {
                    self.declare_external(scope, namespace, item, false)?;
                }
                return Ok(());
            }
            _ => {
                return Err(CoreError::semantic(
                    "expected a declaration (fn, obj, type, mod, impl, declare, use or pub)",
                    &form.location,
                ));
            }
        };
        self.ctx.scopes.register(&self.ctx.entities, scope, id)?;
        if exported {
            self.ctx.scopes.export(scope, id);
        }
        Ok(())
    }

    fn decl_name<'f>(&self, form: &'f Syntax, keyword: &str) -> Result<&'f str, CoreError> {
        form.tail()
            .first()
            .and_then(Syntax::ident)
            .ok_or_else(|| {
                CoreError::semantic(format!("{keyword} requires a name"), &form.location)
            })
    }

    fn declare_fn(&mut self, scope: ScopeId, form: &Syntax) -> Result<EntityId, CoreError> {
        let header = self.fn_header(form, None)?;
        let first = self.ctx.exprs.next_id();
        let root = self.body(header.body, &form.location)?;
        let mut def = FnDef::new(scope, header.params, FnBody::Expr { first, root });
        def.type_params = header.type_params;
        def.return_expr = header.return_expr;
        Ok(self
            .ctx
            .entities
            .alloc(header.name, form.location.clone(), EntityKind::Fn(def)))
    }

    /// Reads everything of a `fn` form up to its body. `receiver` is the
    /// type given to a bare `self` parameter.
    fn fn_header<'f>(
        &mut self,
        form: &'f Syntax,
        receiver: Option<&TypeExpr>,
    ) -> Result<FnHeader<'f>, CoreError> {
        let name = self.decl_name(form, "fn")?;
        let mut rest = &form.tail()[1..];
        let mut type_params = Vec::new();
        let mut params = None;
        let mut return_expr = None;
        while let Some(item) = rest.first() {
            if item.is_call("type_params") {
                type_params = idents(item.tail())?;
            } else if item.is_call("parameters") {
                params = Some(self.params(item, receiver)?);
            } else if item.is_call("return_type") {
                let [ty] = item.tail() else {
                    return Err(CoreError::semantic(
                        "return_type takes exactly one type",
                        &item.location,
                    ));
                };
                return_expr = Some(type_expr(ty)?);
            } else {
                break;
            }
            rest = &rest[1..];
        }
        let params = params.ok_or_else(|| {
            CoreError::semantic(
                format!("fn `{name}` requires a (parameters ...) form"),
                &form.location,
            )
        })?;
        Ok(FnHeader {
            name,
            type_params,
            params,
            return_expr,
            body: rest,
        })
    }

    fn params(
        &mut self,
        form: &Syntax,
        receiver: Option<&TypeExpr>,
    ) -> Result<Vec<ParamDecl>, CoreError> {
        form.tail()
            .iter()
            .map(|param| {
                let (name, annotation) = match (param.ident(), receiver) {
                    (Some("self"), Some(target)) => ("self", target.clone()),
                    _ => typed_name(param)?,
                };
                Ok(ParamDecl {
                    name: name.to_string(),
                    annotation,
                    location: param.location.clone(),
                })
            })
            .collect()
    }

    fn declare_impl(&mut self, scope: ScopeId, form: &Syntax) -> Result<(), CoreError> {
        let mut rest = form.tail();
        let mut impl_params = Vec::new();
        if let Some(first) = rest.first()
            && first.is_call("type_params")
        {
            impl_params = idents(first.tail())?;
            rest = &rest[1..];
        }
        let Some((target, items)) = rest.split_first() else {
            return Err(CoreError::semantic("impl requires a target type", &form.location));
        };
        let target = type_expr(target)?;
        let mut methods = Vec::with_capacity(items.len());
        for item in items {
            if !item.is_call("fn") {
                return Err(CoreError::semantic(
                    "impl blocks only contain fn declarations",
                    &item.location,
                ));
            }
            let header = self.fn_header(item, Some(&target))?;
            let first = self.ctx.exprs.next_id();
            let root = self.body(header.body, &item.location)?;
            let mut def = FnDef::new(scope, header.params, FnBody::Expr { first, root });
            def.type_params = impl_params.iter().cloned().chain(header.type_params).collect();
            def.return_expr = header.return_expr;
            methods.push(self.ctx.entities.alloc(
                header.name,
                item.location.clone(),
                EntityKind::Fn(def),
            ));
        }
        self.ctx.pending_impls.push(PendingImpl {
            scope,
            target,
            methods,
            location: form.location.clone(),
        });
        Ok(())
    }

    /// One item of a `declare` block: a bodiless `fn`, optionally wrapped
    /// in `pub` or grouped in a `block`.
    fn declare_external(
        &mut self,
        scope: ScopeId,
        namespace: &str,
        form: &Syntax,
        exported: bool,
    ) -> Result<(), CoreError> {
        if form.is_call("block") || form.is_call("pub") {
            let exported = exported || form.is_call("pub");
            for item in form.tail() {
                self.declare_external(scope, namespace, item, exported)?;
            }
            return Ok(());
        }
        if !form.is_call("fn") {
            return Err(CoreError::semantic(
                "declare blocks only contain fn signatures",
                &form.location,
            ));
        }
        let header = self.fn_header(form, None)?;
        if !header.type_params.is_empty() || !header.body.is_empty() {
            return Err(CoreError::semantic(
                format!("declared fn `{}` cannot have type parameters or a body", header.name),
                &form.location,
            ));
        }
        let body = FnBody::Import {
            module: namespace.to_string(),
            name: header.name.to_string(),
        };
        let mut def = FnDef::new(scope, header.params, body);
        def.return_expr = header.return_expr;
        let id = self
            .ctx
            .entities
            .alloc(header.name, form.location.clone(), EntityKind::Fn(def));
        self.ctx.scopes.register(&self.ctx.entities, scope, id)?;
        if exported {
            self.ctx.scopes.export(scope, id);
        }
        Ok(())
    }

    fn declare_obj(&mut self, scope: ScopeId, form: &Syntax) -> Result<EntityId, CoreError> {
        let name = self.decl_name(form, "obj")?;
        let mut type_params = Vec::new();
        let mut parent_expr = None;
        let mut field_exprs: Vec<(String, TypeExpr)> = Vec::new();
        for item in &form.tail()[1..] {
            if item.is_call("type_params") {
                type_params = idents(item.tail())?;
            } else if item.is_call("extends") {
                let [parent] = item.tail() else {
                    return Err(CoreError::semantic(
                        "extends takes exactly one type",
                        &item.location,
                    ));
                };
                parent_expr = Some(type_expr(parent)?);
            } else {
                let (field, ty) = typed_name(item)?;
                if field_exprs.iter().any(|(existing, _)| existing == field) {
                    return Err(CoreError::DuplicateBinding {
                        name: field.to_string(),
                        location: item.location.clone(),
                    });
                }
                field_exprs.push((field.to_string(), ty));
            }
        }
        let def = ObjectDef {
            scope,
            type_params,
            applied_args: Vec::new(),
            generic_of: None,
            parent_expr,
            field_exprs,
            parent: None,
            fields: Vec::new(),
            state: ResolveState::Pending,
            instances: Vec::new(),
            methods: Vec::new(),
        };
        Ok(self
            .ctx
            .entities
            .alloc(name, form.location.clone(), EntityKind::Object(def)))
    }

    fn declare_alias(&mut self, scope: ScopeId, form: &Syntax) -> Result<EntityId, CoreError> {
        let name = self.decl_name(form, "type")?;
        let [_, target] = form.tail() else {
            return Err(CoreError::semantic(
                "type takes a name and a type",
                &form.location,
            ));
        };
        let def = AliasDef {
            scope,
            target: type_expr(target)?,
            resolved: None,
            state: ResolveState::Pending,
        };
        Ok(self
            .ctx
            .entities
            .alloc(name, form.location.clone(), EntityKind::Alias(def)))
    }

    fn declare_use(&mut self, scope: ScopeId, form: &Syntax) -> Result<(), CoreError> {
        let (path, alias) = match form.tail() {
            [path] => (path, None),
            [path, alias] => {
                let alias = alias.ident().ok_or_else(|| {
                    CoreError::semantic("use alias must be an identifier", &alias.location)
                })?;
                (path, Some(alias.to_string()))
            }
            _ => {
                return Err(CoreError::semantic(
                    "use takes a path and an optional alias",
                    &form.location,
                ));
            }
        };
        let path = match path.ident() {
            Some(name) => vec![name.to_string()],
            None if path.is_call("::") => idents(path.tail())?,
            None => {
                return Err(CoreError::semantic(
                    "use path must be an identifier or a (:: ...) form",
                    &path.location,
                ));
            }
        };
        if path.is_empty() {
            return Err(CoreError::semantic("use path is empty", &form.location));
        }
        self.ctx.pending_uses.push(PendingUse {
            scope,
            path,
            alias,
            location: form.location.clone(),
        });
        Ok(())
    }

    /// Lowers a body; several expressions become an implicit block.
    fn body(&mut self, exprs: &[Syntax], location: &SourceLocation) -> Result<ExprId, CoreError> {
        if let [single] = exprs {
            return self.expr(single);
        }
        let body = exprs
            .iter()
            .map(|expr| self.expr(expr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.alloc(HirExprKind::Block { body, scope: None }, location))
    }

    fn expr(&mut self, syntax: &Syntax) -> Result<ExprId, CoreError> {
        let location = &syntax.location;
        let items = match &syntax.kind {
            SyntaxKind::Int { value, ty } => {
                return Ok(self.alloc(HirExprKind::Literal(Literal::Int(*value, *ty)), location));
            }
            SyntaxKind::Float { value, ty } => {
                return Ok(
                    self.alloc(HirExprKind::Literal(Literal::Float(*value, *ty)), location)
                );
            }
            SyntaxKind::Bool(value) => {
                return Ok(self.alloc(HirExprKind::Literal(Literal::Bool(*value)), location));
            }
            SyntaxKind::Ident(name) => {
                let kind = HirExprKind::Ident {
                    name: name.clone(),
                    binding: None,
                };
                return Ok(self.alloc(kind, location));
            }
            SyntaxKind::Str(_) => {
                return Err(CoreError::semantic(
                    "string literals are only valid as declare namespaces",
                    location,
                ));
            }
            SyntaxKind::List(items) => items,
        };

        let Some(head) = items.first() else {
            return Err(CoreError::semantic("empty form", location));
        };
        let Some(name) = head.ident() else {
            return Err(CoreError::semantic(
                "expected an identifier at the head of a form",
                &head.location,
            ));
        };
        let args = &items[1..];
        match name {
            "block" => {
                let body = args
                    .iter()
                    .map(|expr| self.expr(expr))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.alloc(HirExprKind::Block { body, scope: None }, location))
            }
            "define" | "define_mut" => self.define(args, name == "define_mut", location),
            "=" => {
                let [target, value] = args else {
                    return Err(CoreError::semantic("= takes a variable and a value", location));
                };
                let name = target.ident().ok_or_else(|| {
                    CoreError::semantic("only variables can be assigned", &target.location)
                })?;
                let value = self.expr(value)?;
                let kind = HirExprKind::Assign {
                    name: name.to_string(),
                    value,
                    target: None,
                };
                Ok(self.alloc(kind, location))
            }
            "if" => {
                let (cond, then_branch, else_branch) = match args {
                    [cond, then_branch] => (cond, then_branch, None),
                    [cond, then_branch, else_branch] => (cond, then_branch, Some(else_branch)),
                    _ => {
                        return Err(CoreError::semantic(
                            "if takes a condition, a branch and an optional else branch",
                            location,
                        ));
                    }
                };
                let cond = self.expr(cond)?;
                let then_branch = self.expr(then_branch)?;
                let else_branch = else_branch.map(|branch| self.expr(branch)).transpose()?;
                let kind = HirExprKind::If {
                    cond,
                    then_branch,
                    else_branch,
                };
                Ok(self.alloc(kind, location))
            }
            "while" => {
                let [cond, body @ ..] = args else {
                    return Err(CoreError::semantic("while requires a condition", location));
                };
                let cond = self.expr(cond)?;
                let body = self.body(body, location)?;
                Ok(self.alloc(HirExprKind::While { cond, body }, location))
            }
            "match" => self.match_expr(args, location),
            "object" => {
                let mut fields: Vec<(String, ExprId)> = Vec::new();
                for field in args {
                    let [colon, name, value] = field.list().unwrap_or(&[]) else {
                        return Err(CoreError::semantic(
                            "object fields are written (: name value)",
                            &field.location,
                        ));
                    };
                    let name = match (colon.ident(), name.ident()) {
                        (Some(":"), Some(name)) => name,
                        _ => {
                            return Err(CoreError::semantic(
                                "object fields are written (: name value)",
                                &field.location,
                            ));
                        }
                    };
                    if fields.iter().any(|(existing, _)| existing == name) {
                        return Err(CoreError::DuplicateBinding {
                            name: name.to_string(),
                            location: field.location.clone(),
                        });
                    }
                    let value = self.expr(value)?;
                    fields.push((name.to_string(), value));
                }
                Ok(self.alloc(HirExprKind::ObjectLiteral { fields }, location))
            }
            "fn" | "obj" | "type" | "mod" | "pub" | "use" => Err(CoreError::semantic(
                "declarations are only allowed at module level",
                location,
            )),
            _ => {
                let (type_args, args) = match args {
                    [first, rest @ ..] if first.is_call("type_args") => (
                        first
                            .tail()
                            .iter()
                            .map(type_expr)
                            .collect::<Result<Vec<_>, _>>()?,
                        rest,
                    ),
                    _ => (Vec::new(), args),
                };
                let args = args
                    .iter()
                    .map(|arg| self.expr(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let kind = HirExprKind::Call {
                    name: name.to_string(),
                    args,
                    type_args,
                    target: None,
                };
                Ok(self.alloc(kind, location))
            }
        }
    }

    fn define(
        &mut self,
        args: &[Syntax],
        mutable: bool,
        location: &SourceLocation,
    ) -> Result<ExprId, CoreError> {
        let [target, init] = args else {
            return Err(CoreError::semantic(
                "define takes a name and an initializer",
                location,
            ));
        };
        let (name, annotation) = match target.ident() {
            Some(name) => (name, None),
            None => {
                let (name, ty) = typed_name(target)?;
                (name, Some(ty))
            }
        };
        let init = self.expr(init)?;
        let kind = HirExprKind::Let {
            name: name.to_string(),
            annotation,
            init,
            mutable,
            entity: None,
        };
        Ok(self.alloc(kind, location))
    }

    fn match_expr(&mut self, args: &[Syntax], location: &SourceLocation) -> Result<ExprId, CoreError> {
        let [operand, rest @ ..] = args else {
            return Err(CoreError::InvalidPattern {
                message: "match requires an operand".into(),
                location: location.clone(),
            });
        };
        let (bind, arms) = match rest.first().and_then(Syntax::ident) {
            Some(bind) => (Some(bind.to_string()), &rest[1..]),
            None => (None, rest),
        };
        let operand = self.expr(operand)?;

        let mut cases = Vec::new();
        let mut default = None;
        for arm in arms {
            let invalid = |message: &str| CoreError::InvalidPattern {
                message: message.to_string(),
                location: arm.location.clone(),
            };
            if default.is_some() {
                return Err(invalid("`else` must be the last arm of a match"));
            }
            if arm.is_call("=>") {
                let [pattern, body @ ..] = arm.tail() else {
                    return Err(invalid("a case needs a pattern and a body"));
                };
                if body.is_empty() {
                    return Err(invalid("a case needs a pattern and a body"));
                }
                let pattern = match &pattern.kind {
                    SyntaxKind::Int { value, ty } => Pattern::Literal(Literal::Int(*value, *ty)),
                    SyntaxKind::Float { value, ty } => {
                        Pattern::Literal(Literal::Float(*value, *ty))
                    }
                    SyntaxKind::Bool(value) => Pattern::Literal(Literal::Bool(*value)),
                    SyntaxKind::Ident(_) | SyntaxKind::List(_) => Pattern::Type(type_expr(pattern)?),
                    SyntaxKind::Str(_) => return Err(invalid("string patterns are not supported")),
                };
                let body = self.body(body, &arm.location)?;
                cases.push(MatchCase {
                    pattern,
                    body,
                    location: arm.location.clone(),
                    binding: None,
                    pattern_ty: None,
                });
            } else if arm.is_call("else") {
                default = Some(self.body(arm.tail(), &arm.location)?);
            } else {
                return Err(invalid("expected (=> pattern body) or (else body)"));
            }
        }

        let literal_cases = cases
            .iter()
            .filter(|case| matches!(case.pattern, Pattern::Literal(_)))
            .count();
        if literal_cases != 0 && literal_cases != cases.len() {
            return Err(CoreError::InvalidPattern {
                message: "a match cannot mix literal and type patterns".into(),
                location: location.clone(),
            });
        }
        if cases.is_empty() && default.is_none() {
            return Err(CoreError::InvalidPattern {
                message: "match has no arms".into(),
                location: location.clone(),
            });
        }

        let kind = HirExprKind::Match(MatchExpr {
            operand,
            bind,
            cases,
            default,
            default_binding: None,
        });
        Ok(self.alloc(kind, location))
    }

    fn alloc(&mut self, kind: HirExprKind, location: &SourceLocation) -> ExprId {
        self.ctx.exprs.alloc(kind, location.clone())
    }
}

/// Reads a type expression: `T` or `(Generic Arg ...)`.
pub fn type_expr(syntax: &Syntax) -> Result<TypeExpr, CoreError> {
    if let Some(name) = syntax.ident() {
        return Ok(TypeExpr::named(name, syntax.location.clone()));
    }
    match syntax.list() {
        Some([head, args @ ..]) if !args.is_empty() => {
            let name = head.ident().ok_or_else(|| {
                CoreError::semantic("expected a type name", &head.location)
            })?;
            Ok(TypeExpr::Apply {
                name: name.to_string(),
                args: args.iter().map(type_expr).collect::<Result<_, _>>()?,
                location: syntax.location.clone(),
            })
        }
        _ => Err(CoreError::semantic("malformed type", &syntax.location)),
    }
}

/// Reads `(: name Type)`.
fn typed_name(syntax: &Syntax) -> Result<(&str, TypeExpr), CoreError> {
    match syntax.list() {
        Some([colon, name, ty]) if colon.ident() == Some(":") => {
            let name = name.ident().ok_or_else(|| {
                CoreError::semantic("expected a name", &name.location)
            })?;
            Ok((name, type_expr(ty)?))
        }
        _ => Err(CoreError::semantic(
            "expected (: name Type)",
            &syntax.location,
        )),
    }
}

fn idents(items: &[Syntax]) -> Result<Vec<String>, CoreError> {
    items
        .iter()
        .map(|item| {
            item.ident()
                .map(str::to_string)
                .ok_or_else(|| CoreError::semantic("expected an identifier", &item.location))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn scan(source: &str) -> Result<(Context, ScopeId), CoreError> {
        let mut ctx = Context::new()?;
        let root = ctx.scopes.root();
        let (_, scope) = declare_module(&mut ctx, root, "main", SourceLocation::builtin())?;
        let forms = parse("test.vast", source)?;
        scan_module(&mut ctx, scope, &forms)?;
        Ok((ctx, scope))
    }

    #[test]
    fn declares_functions_objects_and_aliases() {
        let (ctx, scope) = scan(
            "(obj Vec (: x i32) (: y i32))
             (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
             (type Ints (FixedArray i32))
             (fn get (parameters (: v Vec)) (return_type i32) (x v))
             (fn get (parameters (: v Point)) (z v))",
        )
        .expect("scan");
        let point = ctx.scopes.resolve(&ctx.entities, scope, "Point").expect("Point");
        let def = ctx.entities.object(point).expect("object");
        assert!(def.parent_expr.is_some());
        assert_eq!(def.field_exprs.len(), 3);
        assert!(ctx.scopes.resolve(&ctx.entities, scope, "Ints").is_some());
        assert_eq!(ctx.scopes.resolve_overloads(&ctx.entities, scope, "get").len(), 2);
    }

    #[test]
    fn function_bodies_are_contiguous_with_the_root_last() {
        let (ctx, scope) =
            scan("(fn f (parameters (: n i32)) (define x (+ n 1)) (* x 2))").expect("scan");
        let f = ctx.scopes.resolve_overloads(&ctx.entities, scope, "f")[0];
        let FnBody::Expr { first, root } = ctx.entities.func(f).expect("fn").body else {
            panic!("expected an expression body");
        };
        assert_eq!(root.index() as usize, ctx.exprs.len() - 1);
        assert!(matches!(ctx.exprs.get(root).kind, HirExprKind::Block { .. }));
        assert!(matches!(
            ctx.exprs.get(first).kind,
            HirExprKind::Ident { .. }
        ));
    }

    #[test]
    fn pub_declarations_are_exported() {
        let (ctx, scope) = scan(
            "(pub (fn a (parameters) 1))
             (fn b (parameters) 2)
             (pub (mod inner (pub (fn c (parameters) 3))))",
        )
        .expect("scan");
        let exports: Vec<_> = ctx
            .scopes
            .exports(scope)
            .iter()
            .map(|id| ctx.entities.get(*id).name.clone())
            .collect();
        assert_eq!(exports, vec!["a".to_string(), "inner".to_string()]);
    }

    #[test]
    fn records_use_forms_for_later_binding() {
        let (ctx, _) = scan("(use (:: std all)) (use (:: m1 m2 test) hi)").expect("scan");
        assert_eq!(ctx.pending_uses.len(), 2);
        assert_eq!(ctx.pending_uses[1].path, vec!["m1", "m2", "test"]);
        assert_eq!(ctx.pending_uses[1].alias.as_deref(), Some("hi"));
    }

    #[test]
    fn imports_bind_exported_entities() {
        let (mut ctx, scope) = scan(
            "(mod m1 (pub (mod m2 (pub (fn test (parameters) 597)) (fn hidden (parameters) 1))))
             (use (:: m1 m2 test) hi)
             (use (:: m1 m2 all))",
        )
        .expect("scan");
        bind_imports(&mut ctx).expect("imports");
        let hi = ctx.scopes.resolve_overloads(&ctx.entities, scope, "hi");
        let test = ctx.scopes.resolve_overloads(&ctx.entities, scope, "test");
        assert_eq!(hi.len(), 1);
        assert_eq!(hi, test);
        assert!(ctx.scopes.resolve_overloads(&ctx.entities, scope, "hidden").is_empty());
    }

    #[test]
    fn importing_a_private_name_fails() {
        let (mut ctx, _) = scan(
            "(mod m1 (fn secret (parameters) 1))
             (use (:: m1 secret))",
        )
        .expect("scan");
        let err = bind_imports(&mut ctx).unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedIdentifier { .. }));
    }

    #[test]
    fn rejects_mixed_and_misplaced_patterns() {
        let err = scan("(fn f (parameters (: v i32)) (match v (=> 1 1) (=> Vec 2)))").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPattern { .. }));

        let err = scan("(fn f (parameters (: v i32)) (match v (else 1) (else 2)))").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPattern { .. }));

        let err = scan("(fn f (parameters (: v i32)) (match v))").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPattern { .. }));
    }

    #[test]
    fn rejects_duplicate_declarations_and_nested_declarations() {
        let err = scan("(obj A (: x i32)) (obj A (: y i32))").unwrap_err();
        assert!(matches!(err, CoreError::DuplicateBinding { .. }));

        let err = scan("(obj A (: x i32) (: x i64))").unwrap_err();
        assert!(matches!(err, CoreError::DuplicateBinding { .. }));

        let err = scan("(fn f (parameters) (fn g (parameters) 1))").unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));

        let err = scan("(+ 1 2)").unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));
    }

    #[test]
    fn impl_methods_stay_out_of_module_scope() {
        let (ctx, scope) = scan(
            "(obj Box (type_params T) (: value T))
             (impl (type_params T) (Box T)
               (fn get (parameters self) (value self))
               (fn put (type_params U) (parameters self (: other U)) other))",
        )
        .expect("scan");
        assert!(ctx.scopes.resolve_overloads(&ctx.entities, scope, "get").is_empty());
        let [block] = ctx.pending_impls.as_slice() else {
            panic!("expected one impl block");
        };
        assert!(matches!(&block.target, TypeExpr::Apply { name, .. } if name == "Box"));
        let get = ctx.entities.func(block.methods[0]).expect("get");
        assert_eq!(get.type_params, vec!["T".to_string()]);
        assert_eq!(get.params[0].name, "self");
        assert!(matches!(&get.params[0].annotation, TypeExpr::Apply { name, .. } if name == "Box"));
        let put = ctx.entities.func(block.methods[1]).expect("put");
        assert_eq!(put.type_params, vec!["T".to_string(), "U".to_string()]);
    }

    #[test]
    fn declared_functions_are_host_imports() {
        let (ctx, scope) = scan(
            "(declare \"imports\"
               (pub (fn print (parameters (: v i32))))
               (block (fn now (parameters) (return_type i64))))",
        )
        .expect("scan");
        let print = ctx.scopes.resolve_overloads(&ctx.entities, scope, "print")[0];
        let def = ctx.entities.func(print).expect("print");
        assert!(matches!(
            &def.body,
            FnBody::Import { module, name } if module == "imports" && name == "print"
        ));
        assert!(!def.has_body());
        assert!(ctx.scopes.exports(scope).contains(&print));
        let now = ctx.scopes.resolve_overloads(&ctx.entities, scope, "now")[0];
        assert!(!ctx.scopes.exports(scope).contains(&now));
    }

    #[test]
    fn declared_functions_cannot_have_bodies() {
        let err = scan("(declare \"imports\" (fn one (parameters) 1))").unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));
        let err = scan("(declare imports (fn one (parameters)))").unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));
    }

    #[test]
    fn string_literals_are_not_expressions() {
        let err = scan("(fn f (parameters) \"text\")").unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));
    }
}
