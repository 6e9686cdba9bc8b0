//! Symbolic matrix entries.
//!
//! Model matrices are declared with entries such as `dt`, `dt**2/2` or
//! `sigma_a_sq*dt**5/20`. Static parameters (`sigma_a_sq`, `a`, `b`, ...) are
//! bound once when the configuration is compiled; what remains is a formula
//! of the time step, evaluated at every predict.
//!
//! Grammar (`**` and `^` are both accepted for powers):
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := signed (('*' | '/') signed)*
//! signed := ('-' | '+') signed | power
//! power  := atom (('**' | '^') signed)?
//! atom   := number | identifier | '(' expr ')'
//! ```

use crate::{
    error::{ImmError, ImmResult},
    types::DMat,
};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, one_of},
    combinator::{all_consuming, map, map_res, not, opt, recognize},
    multi::{many0, many0_count},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the per-cycle time step variable.
pub const TIME_STEP: &str = "dt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => {
                if rhs.fract() == 0.0 && rhs.abs() <= i32::MAX as f64 {
                    lhs.powi(rhs as i32)
                } else {
                    lhs.powf(rhs)
                }
            }
        }
    }
}

/// Parsed arithmetic expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn parse(source: &str) -> ImmResult<Expr> {
        match all_consuming(delimited(multispace0, parse_expr, multispace0))(source) {
            Ok((_, expr)) => Ok(expr),
            Err(e) => Err(ImmError::config(format!(
                "cannot parse expression '{source}': {e}"
            ))),
        }
    }

    /// Free variables referenced by the expression.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
        }
    }

    /// Substitute the given parameters and fold every constant subtree.
    pub fn bind(&self, params: &BTreeMap<String, f64>) -> Expr {
        match self {
            Expr::Number(v) => Expr::Number(*v),
            Expr::Variable(name) => match params.get(name) {
                Some(v) => Expr::Number(*v),
                None => Expr::Variable(name.clone()),
            },
            Expr::Neg(inner) => match inner.bind(params) {
                Expr::Number(v) => Expr::Number(-v),
                other => Expr::Neg(Box::new(other)),
            },
            Expr::Binary { op, lhs, rhs } => match (lhs.bind(params), rhs.bind(params)) {
                (Expr::Number(a), Expr::Number(b)) => Expr::Number(op.apply(a, b)),
                (l, r) => Expr::Binary {
                    op: *op,
                    lhs: Box::new(l),
                    rhs: Box::new(r),
                },
            },
        }
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Expr::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn eval(&self, bindings: &[(&str, f64)]) -> ImmResult<f64> {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Variable(name) => bindings
                .iter()
                .find(|(n, _)| *n == name.as_str())
                .map(|(_, v)| *v)
                .ok_or_else(|| ImmError::config(format!("unbound variable '{name}'"))),
            Expr::Neg(inner) => Ok(-inner.eval(bindings)?),
            Expr::Binary { op, lhs, rhs } => Ok(op.apply(lhs.eval(bindings)?, rhs.eval(bindings)?)),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn parse_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_term(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(char('+'), |_| BinaryOp::Add),
            map(char('-'), |_| BinaryOp::Sub),
        ))),
        parse_term,
    ))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, (op, rhs)| binary(op, acc, rhs)),
    ))
}

fn parse_term(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_signed(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(terminated(char('*'), not(char('*'))), |_| BinaryOp::Mul),
            map(char('/'), |_| BinaryOp::Div),
        ))),
        parse_signed,
    ))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, (op, rhs)| binary(op, acc, rhs)),
    ))
}

fn parse_signed(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), parse_signed), |e| Expr::Neg(Box::new(e))),
        preceded(ws(char('+')), parse_signed),
        parse_power,
    ))(input)
}

fn parse_power(input: &str) -> IResult<&str, Expr> {
    let (input, base) = parse_atom(input)?;
    let (input, exponent) = opt(preceded(ws(alt((tag("**"), tag("^")))), parse_signed))(input)?;
    Ok((
        input,
        match exponent {
            Some(exp) => binary(BinaryOp::Pow, base, exp),
            None => base,
        },
    ))
}

fn parse_atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(parse_number, Expr::Number),
        map(parse_identifier, |s: &str| Expr::Variable(s.to_string())),
        delimited(char('('), parse_expr, char(')')),
    )))(input)
}

fn parse_number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((
            alt((
                recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                recognize(pair(char('.'), digit1)),
            )),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        str::parse::<f64>,
    )(input)
}

fn parse_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

// ---------------------------------------------------------------------------
// Matrix formulas
// ---------------------------------------------------------------------------

/// One matrix entry after parameter binding.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Constant(f64),
    Formula(Expr),
}

impl Entry {
    /// Bind parameters into `expr`, collapsing it to a constant when possible.
    pub fn bound(expr: &Expr, params: &BTreeMap<String, f64>) -> Entry {
        let bound = expr.bind(params);
        match bound.as_constant() {
            Some(v) => Entry::Constant(v),
            None => Entry::Formula(bound),
        }
    }
}

/// A matrix whose entries may depend on the time step.
///
/// Constant matrices are evaluated once and cached.
#[derive(Clone, Debug)]
pub struct MatrixFormula {
    rows: usize,
    cols: usize,
    entries: Vec<Entry>,
    cached: Option<DMat>,
}

impl MatrixFormula {
    /// Build from row-major entries.
    pub fn new(rows: usize, cols: usize, entries: Vec<Entry>) -> ImmResult<Self> {
        if entries.len() != rows * cols {
            return Err(ImmError::mismatch("matrix formula entries", rows * cols, entries.len()));
        }
        let cached = entries
            .iter()
            .map(|e| match e {
                Entry::Constant(v) => Some(*v),
                Entry::Formula(_) => None,
            })
            .collect::<Option<Vec<f64>>>()
            .map(|values| DMat::from_row_slice(rows, cols, &values));
        Ok(Self {
            rows,
            cols,
            entries,
            cached,
        })
    }

    pub fn constant(m: DMat) -> Self {
        let entries = m
            .transpose()
            .iter()
            .map(|v| Entry::Constant(*v))
            .collect();
        Self {
            rows: m.nrows(),
            cols: m.ncols(),
            entries,
            cached: Some(m),
        }
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn is_constant(&self) -> bool {
        self.cached.is_some()
    }

    pub fn free_variables(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Formula(expr) => Some(expr.variables()),
                Entry::Constant(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Evaluate every entry at time step `dt`.
    pub fn evaluate(&self, dt: f64) -> ImmResult<DMat> {
        if let Some(m) = &self.cached {
            return Ok(m.clone());
        }
        let bindings = [(TIME_STEP, dt)];
        let values = self
            .entries
            .iter()
            .map(|e| match e {
                Entry::Constant(v) => Ok(*v),
                Entry::Formula(expr) => expr.eval(&bindings),
            })
            .collect::<ImmResult<Vec<f64>>>()?;
        Ok(DMat::from_row_slice(self.rows, self.cols, &values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn eval_dt(src: &str, dt: f64) -> f64 {
        Expr::parse(src).unwrap().eval(&[("dt", dt)]).unwrap()
    }

    #[test]
    fn parses_config_style_entries() {
        assert_abs_diff_eq!(eval_dt("dt", 0.5), 0.5);
        assert_abs_diff_eq!(eval_dt("dt**2/2", 2.0), 2.0);
        assert_abs_diff_eq!(eval_dt("dt^2/2", 2.0), 2.0);
        assert_abs_diff_eq!(eval_dt(" 1 ", 9.0), 1.0);
        assert_abs_diff_eq!(eval_dt("1.05", 0.0), 1.05);
        assert_abs_diff_eq!(eval_dt("2.5e-1*dt", 4.0), 1.0);
    }

    #[test]
    fn precedence_and_associativity() {
        assert_abs_diff_eq!(eval_dt("1 + 2 * 3", 0.0), 7.0);
        assert_abs_diff_eq!(eval_dt("(1 + 2) * 3", 0.0), 9.0);
        assert_abs_diff_eq!(eval_dt("8 / 4 / 2", 0.0), 1.0);
        assert_abs_diff_eq!(eval_dt("2 ** 3 ** 2", 0.0), 512.0);
        assert_abs_diff_eq!(eval_dt("-dt**2", 3.0), -9.0);
        assert_abs_diff_eq!(eval_dt("2*-dt", 3.0), -6.0);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "dt**", "(dt", "dt dt", "3 $ 4", "*dt"] {
            assert!(
                matches!(Expr::parse(bad), Err(ImmError::Configuration(_))),
                "'{bad}' should not parse"
            );
        }
    }

    #[test]
    fn binding_folds_parameters() {
        let expr = Expr::parse("sigma_a_sq*dt**5/20").unwrap();
        assert_eq!(
            expr.variables(),
            ["dt".to_string(), "sigma_a_sq".to_string()].into_iter().collect()
        );

        let params: BTreeMap<String, f64> = [("sigma_a_sq".to_string(), 2.0)].into_iter().collect();
        let bound = expr.bind(&params);
        assert_eq!(bound.variables().len(), 1);
        assert_abs_diff_eq!(bound.eval(&[("dt", 1.0)]).unwrap(), 0.1);

        let b: BTreeMap<String, f64> = [("b".to_string(), 0.25)].into_iter().collect();
        let coeff = Entry::bound(&Expr::parse("1 - b").unwrap(), &b);
        assert_eq!(coeff, Entry::Constant(0.75));
    }

    #[test]
    fn unbound_variable_is_an_error() {
        let expr = Expr::parse("q * dt").unwrap();
        assert!(expr.eval(&[("dt", 1.0)]).is_err());
    }

    #[test]
    fn matrix_formula_evaluates_per_time_step() {
        let dt = Expr::parse("dt").unwrap();
        let half_sq = Expr::parse("dt**2/2").unwrap();
        let f = MatrixFormula::new(
            2,
            2,
            vec![
                Entry::Constant(1.0),
                Entry::Formula(dt),
                Entry::Constant(0.0),
                Entry::Formula(half_sq),
            ],
        )
        .unwrap();
        assert!(!f.is_constant());
        assert_eq!(f.free_variables(), ["dt".to_string()].into_iter().collect());
        let m = f.evaluate(2.0).unwrap();
        assert_abs_diff_eq!(m[(0, 1)], 2.0);
        assert_abs_diff_eq!(m[(1, 1)], 2.0);
        assert_abs_diff_eq!(m[(1, 0)], 0.0);

        let c = MatrixFormula::constant(DMat::from_row_slice(1, 2, &[3.0, 4.0]));
        assert!(c.is_constant());
        assert_abs_diff_eq!(c.evaluate(100.0).unwrap()[(0, 1)], 4.0);
    }
}
