/// A short, log-friendly description of a message which may be too big to print in full.
pub trait MessageSummary {
    /// Return a string of a big message
    fn summary(&self) -> String;
}

impl<T> MessageSummary for &[T]
where T: MessageSummary
{
    fn summary(&self) -> String {
        match (self.first(), self.last()) {
            (Some(_), Some(_)) if self.len() <= 5 => self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(","),
            (Some(first), Some(last)) => format!("{} ... {}", first.summary(), last.summary()),
            _ => "{}".to_string(),
        }
    }
}

impl<T> MessageSummary for Option<T>
where T: MessageSummary
{
    fn summary(&self) -> String {
        match self {
            None => "None".to_string(),
            Some(x) => format!("Some({})", x.summary()),
        }
    }
}
